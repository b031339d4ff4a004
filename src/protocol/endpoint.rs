//! Endpoint lifecycle: glues the receiver and sender to a byte stream and
//! runs the closing handshake.

use std::{
    collections::VecDeque,
    io::{ErrorKind, Read, Write},
    time::{Duration, Instant},
};

use bytes::Bytes;
use log::{debug, trace};

use crate::{
    error::{Error, ProtocolError, Result},
    extensions::NegotiatedDeflate,
    protocol::{
        config::EndpointConfig,
        frame::{CloseCode, CloseFrame, Utf8Bytes},
        message::Message,
        receiver::{Event, Receiver},
        sender::{Sender, StreamKind},
        Role,
    },
    util::NonBlockingResult,
    READ_BUFFER_SIZE,
};

/// Lifecycle state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Created, socket not yet attached.
    Connecting,
    /// Fully established, data flows both ways.
    Open,
    /// A close frame has been sent or received; draining.
    Closing,
    /// Handshake finished, timed out, or the socket died.
    Closed,
}

/// Events delivered to the endpoint's consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// The endpoint transitioned to OPEN.
    Open,
    /// A complete data message ([`Message::Text`] or [`Message::Binary`]).
    Message(Message),
    /// A ping arrived; the pong reply has already been queued.
    Ping(Bytes),
    /// A pong arrived.
    Pong(Bytes),
    /// The endpoint reached CLOSED. Emitted exactly once per lifetime;
    /// `code` is [`CloseCode::Abnormal`] when no close frame was exchanged
    /// and [`CloseCode::Status`] when the peer's close carried no code.
    Close {
        /// Close status code.
        code: CloseCode,
        /// Close reason text (possibly empty).
        reason: Utf8Bytes,
    },
}

/// Options for a single send.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Ask for permessage-deflate compression (honored when negotiated and
    /// the payload reaches the threshold).
    pub compress: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions { compress: true }
    }
}

/// A WebSocket endpoint bound to a duplex byte stream.
///
/// The endpoint owns the socket exclusively. All state mutation happens on
/// the caller's task; events come out of [`poll_event`](Self::poll_event)
/// in wire order. The stream should be in non-blocking mode (or carry a
/// read timeout) so the close deadline can be observed.
#[derive(Debug)]
pub struct Endpoint<S> {
    stream: S,
    role: Role,
    state: ReadyState,
    receiver: Receiver,
    sender: Sender,
    close_timeout: Duration,
    /// Framed bytes not yet accepted by the socket.
    out_buffer: Vec<u8>,
    /// Events ready for delivery.
    events: VecDeque<EndpointEvent>,
    /// Sends deferred behind an active outbound stream.
    queue: VecDeque<(Message, SendOptions)>,
    close_sent: bool,
    /// `Some` once the peer's close frame arrived; the inner option mirrors
    /// "close frame without a code".
    peer_close: Option<Option<CloseFrame>>,
    close_deadline: Option<Instant>,
    close_emitted: bool,
    paused: bool,
}

impl<S: Read + Write> Endpoint<S> {
    /// Create an endpoint in the CONNECTING state.
    ///
    /// `deflate` carries the parameters agreed during the (out-of-scope)
    /// upgrade; `None` disables compression.
    pub fn new(
        stream: S,
        role: Role,
        deflate: Option<NegotiatedDeflate>,
        config: EndpointConfig,
    ) -> Self {
        let (deflater, inflater, threshold) = match deflate {
            Some(agreed) => {
                let (deflater, inflater) = agreed.split(role);
                (Some(deflater), Some(inflater), agreed.threshold)
            }
            None => (None, None, 0),
        };

        Endpoint {
            receiver: Receiver::new(role, inflater, &config),
            sender: Sender::new(role, deflater, threshold),
            close_timeout: config.close_timeout,
            stream,
            role,
            state: ReadyState::Connecting,
            out_buffer: Vec::new(),
            events: VecDeque::new(),
            queue: VecDeque::new(),
            close_sent: false,
            peer_close: None,
            close_deadline: None,
            close_emitted: false,
            paused: false,
        }
    }

    /// Transition to OPEN, processing any bytes that were buffered during
    /// the upgrade before new socket bytes are read.
    pub fn open(&mut self, initial: &[u8]) -> Result<()> {
        match self.state {
            ReadyState::Connecting => (),
            ReadyState::Open => return Ok(()),
            ReadyState::Closing | ReadyState::Closed => return Err(Error::AlreadyClosed),
        }

        self.state = ReadyState::Open;
        debug!("{} endpoint open", self.role);
        self.events.push_back(EndpointEvent::Open);

        if !initial.is_empty() {
            self.receive_bytes(initial)?;
        }
        Ok(())
    }

    /// Deliver the next event, reading from the socket as needed.
    ///
    /// `Ok(None)` means no event is available right now (the socket would
    /// block, the endpoint is paused, or it is still CONNECTING). Once the
    /// close event has been delivered, further calls return
    /// [`Error::AlreadyClosed`].
    pub fn poll_event(&mut self) -> Result<Option<EndpointEvent>> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }

            match self.state {
                ReadyState::Connecting => return Ok(None),
                ReadyState::Closed => return Err(Error::AlreadyClosed),
                ReadyState::Open | ReadyState::Closing => (),
            }

            if self.close_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                debug!("close handshake timed out");
                self.out_buffer.clear();
                self.finish_close();
                continue;
            }

            if self.paused {
                return Ok(None);
            }

            self.flush_partial()?;

            let mut chunk = [0u8; READ_BUFFER_SIZE];
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    let clean = self.peer_close.is_some();
                    self.finish_close();
                    if clean {
                        continue;
                    }
                    return Err(Error::Protocol(ProtocolError::ResetWithoutClosing));
                }
                Ok(n) => self.receive_bytes(&chunk[..n])?,
                Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None);
                }
                Err(e) => {
                    self.out_buffer.clear();
                    self.finish_close();
                    return Err(e.into());
                }
            }
        }
    }

    /// Send a complete message with default options.
    pub fn send(&mut self, message: impl Into<Message>) -> Result<()> {
        self.send_with(message.into(), SendOptions::default())
    }

    /// Send a complete message.
    ///
    /// While an outbound stream is active, data messages are queued and
    /// replayed in order once the stream finishes.
    pub fn send_with(&mut self, message: Message, options: SendOptions) -> Result<()> {
        self.check_open()?;

        if self.sender.is_streaming() && message.is_data() {
            trace!("queueing send behind active stream");
            self.queue.push_back((message, options));
            return Ok(());
        }

        self.sender.send_message(message, options.compress, &mut self.out_buffer)?;
        self.flush_partial()
    }

    /// Open a streamed (fragmented) outbound message.
    pub fn start_stream(&mut self, kind: StreamKind) -> Result<()> {
        self.check_open()?;
        self.sender.start_stream(kind)
    }

    /// Emit one fragment of the active stream.
    pub fn stream_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        self.sender.stream_frame(data, false, &mut self.out_buffer)?;
        self.flush_partial()
    }

    /// Finish the active stream, then replay queued sends in FIFO order.
    ///
    /// With `None`, a bare FIN-only continuation closes the message.
    pub fn finish_stream(&mut self, data: Option<&[u8]>) -> Result<()> {
        self.check_open()?;
        self.sender.stream_frame(data.unwrap_or(&[]), true, &mut self.out_buffer)?;
        self.flush_partial()?;
        self.replay_queue()
    }

    /// Send a ping. Fails fast outside OPEN.
    pub fn ping(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.check_open()?;
        self.sender.ping(data.into(), &mut self.out_buffer)?;
        self.flush_partial()
    }

    /// Send an unsolicited pong. Fails fast outside OPEN.
    pub fn pong(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.check_open()?;
        self.sender.pong(data.into(), &mut self.out_buffer)?;
        self.flush_partial()
    }

    /// Start the closing handshake with the given code and reason.
    ///
    /// The endpoint keeps processing inbound frames until the peer's close
    /// frame arrives or the close timeout expires, whichever is first.
    /// Calling again while CLOSING is a no-op.
    pub fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        match self.state {
            ReadyState::Connecting => return Err(Error::NotOpen),
            ReadyState::Closing => return Ok(()),
            ReadyState::Closed => return Err(Error::AlreadyClosed),
            ReadyState::Open => (),
        }

        self.begin_close(Some(CloseFrame { code, reason: reason.into() }))
    }

    /// Tear the connection down immediately.
    ///
    /// Buffered output and queued sends are dropped; the close event (code
    /// 1006 unless a close frame was already exchanged) is queued.
    pub fn terminate(&mut self) {
        if self.state == ReadyState::Closed {
            return;
        }
        debug!("terminating endpoint");
        self.out_buffer.clear();
        self.queue.clear();
        self.finish_close();
    }

    /// Stop reading from the socket; buffered events still drain.
    pub fn pause(&mut self) -> Result<()> {
        if self.state == ReadyState::Connecting {
            return Err(Error::NotOpen);
        }
        self.paused = true;
        Ok(())
    }

    /// Resume reading after [`pause`](Self::pause).
    pub fn resume(&mut self) -> Result<()> {
        if self.state == ReadyState::Connecting {
            return Err(Error::NotOpen);
        }
        self.paused = false;
        Ok(())
    }

    /// Retry writing buffered output and flush the stream.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_partial()?;
        if self.out_buffer.is_empty() {
            self.stream.flush().no_block()?;
        }
        Ok(())
    }

    /// Current lifecycle state.
    pub fn ready_state(&self) -> ReadyState {
        self.state
    }

    /// Outbound bytes accepted but not yet written to the socket.
    pub fn bytes_buffered(&self) -> usize {
        self.out_buffer.len()
    }

    /// Total bytes received from the socket.
    pub fn bytes_received(&self) -> u64 {
        self.receiver.bytes_received()
    }

    /// The endpoint's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Shared reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Mutable reference to the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    fn check_open(&self) -> Result<()> {
        match self.state {
            ReadyState::Open => Ok(()),
            ReadyState::Connecting => Err(Error::NotOpen),
            ReadyState::Closing => Err(Error::Protocol(ProtocolError::SendAfterClose)),
            ReadyState::Closed => Err(Error::AlreadyClosed),
        }
    }

    /// Feed wire bytes through the receiver and route the results. On a
    /// protocol violation the mapped close frame goes out before the error
    /// is returned to the caller.
    fn receive_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if let Err(error) = self.receiver.add(bytes) {
            self.fail_with(&error);
            return Err(error);
        }
        self.route_events()
    }

    fn route_events(&mut self) -> Result<()> {
        while let Some(event) = self.receiver.next_event() {
            match event {
                Event::Text(text) => self.on_data(Message::Text(text)),
                Event::Binary(data) => self.on_data(Message::Binary(data)),
                Event::Ping(data) => {
                    // Once the close handshake starts only the peer's close
                    // frame matters.
                    if self.state == ReadyState::Open && self.peer_close.is_none() {
                        self.events.push_back(EndpointEvent::Ping(data.clone()));
                        self.autoreply_pong(data);
                    }
                }
                Event::Pong(data) => {
                    if self.state == ReadyState::Open && self.peer_close.is_none() {
                        self.events.push_back(EndpointEvent::Pong(data));
                    }
                }
                Event::Close(frame) => self.on_peer_close(frame)?,
            }
        }
        Ok(())
    }

    fn on_data(&mut self, message: Message) {
        // Data frames arriving after the close handshake started are
        // discarded; already-queued events still reach the consumer.
        if self.state == ReadyState::Open && self.peer_close.is_none() {
            self.events.push_back(EndpointEvent::Message(message));
        } else {
            trace!("discarding data message in {:?}", self.state);
        }
    }

    /// Reply path: drops silently unless fully open.
    fn autoreply_pong(&mut self, data: Bytes) {
        if self.state != ReadyState::Open || self.close_sent {
            return;
        }
        if self.sender.pong(data, &mut self.out_buffer).is_ok() {
            let _ = self.flush_partial();
        }
    }

    fn on_peer_close(&mut self, frame: Option<CloseFrame>) -> Result<()> {
        if self.peer_close.is_some() {
            return Ok(());
        }
        debug!("peer close: {frame:?}");
        self.peer_close = Some(frame.clone());
        if self.state == ReadyState::Open {
            self.state = ReadyState::Closing;
        }

        if self.close_sent {
            // We initiated; the peer's reply completes the handshake.
            let _ = self.flush_partial();
            self.finish_close();
            return Ok(());
        }

        // Reciprocate, echoing the peer's code.
        self.close_sent = true;
        self.sender.close(frame, &mut self.out_buffer)?;
        self.flush_partial()?;

        match self.role {
            // The server ends the socket once both close frames are out.
            Role::Server => self.finish_close(),
            // The client waits for the server to end the socket, bounded by
            // the close timeout.
            Role::Client => {
                self.close_deadline = Some(Instant::now() + self.close_timeout);
            }
        }
        Ok(())
    }

    fn begin_close(&mut self, frame: Option<CloseFrame>) -> Result<()> {
        if self.close_sent {
            return Ok(());
        }

        self.sender.close(frame, &mut self.out_buffer)?;
        self.close_sent = true;
        if self.state == ReadyState::Open {
            self.state = ReadyState::Closing;
        }
        self.close_deadline = Some(Instant::now() + self.close_timeout);
        self.flush_partial()
    }

    /// Map a receiver error to its close frame and start closing. Errors on
    /// this path are swallowed; the original error reaches the caller.
    fn fail_with(&mut self, error: &Error) {
        let Some(code) = error.close_code() else {
            self.out_buffer.clear();
            self.finish_close();
            return;
        };

        debug!("protocol failure: {error}; closing with {code}");
        let _ = self.begin_close(Some(CloseFrame { code, reason: Utf8Bytes::default() }));
        // The inbound stream is no longer trustworthy; ignore everything
        // after the offending frame and let the peer's EOF or the close
        // deadline finish the teardown.
        self.receiver.cleanup();
    }

    /// Transition to CLOSED and queue the single close event.
    fn finish_close(&mut self) {
        if self.state == ReadyState::Closed {
            return;
        }
        self.state = ReadyState::Closed;
        self.close_deadline = None;
        self.queue.clear();
        self.receiver.cleanup();

        if !self.close_emitted {
            self.close_emitted = true;
            let (code, reason) = match &self.peer_close {
                Some(Some(frame)) => (frame.code, frame.reason.clone()),
                Some(None) => (CloseCode::Status, Utf8Bytes::default()),
                None => (CloseCode::Abnormal, Utf8Bytes::default()),
            };
            debug!("endpoint closed: code={code}");
            self.events.push_back(EndpointEvent::Close { code, reason });
        }
    }

    fn replay_queue(&mut self) -> Result<()> {
        while let Some((message, options)) = self.queue.pop_front() {
            if self.state != ReadyState::Open {
                break;
            }
            self.sender.send_message(message, options.compress, &mut self.out_buffer)?;
        }
        self.flush_partial()
    }

    /// Drain the out-buffer into the socket without blocking; leftover
    /// bytes stay visible through [`bytes_buffered`](Self::bytes_buffered).
    fn flush_partial(&mut self) -> Result<()> {
        while !self.out_buffer.is_empty() {
            match self.stream.write(&self.out_buffer) {
                Ok(0) => {
                    self.out_buffer.clear();
                    self.finish_close();
                    return Err(std::io::Error::new(
                        ErrorKind::ConnectionReset,
                        "Connection reset while sending",
                    )
                    .into());
                }
                Ok(n) => {
                    self.out_buffer.drain(..n);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    self.out_buffer.clear();
                    self.finish_close();
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}
