//! Inbound half: consumes byte chunks, emits messages and control events.

use std::{collections::VecDeque, io::Cursor};

use bytes::{Buf, Bytes, BytesMut};
use log::trace;

use crate::{
    error::{CapacityError, Error, ProtocolError, Result},
    extensions::Inflater,
    protocol::{
        config::EndpointConfig,
        frame::{apply_mask, CloseFrame, Control, Data, Frame, FrameHeader, OpCode, Utf8Bytes},
        message::{IncompleteMessage, IncompleteMessageType, Message},
        Role,
    },
};

/// A logical event produced by the receiver, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A complete text message.
    Text(Utf8Bytes),
    /// A complete binary message.
    Binary(Bytes),
    /// A ping with its payload.
    Ping(Bytes),
    /// A pong with its payload.
    Pong(Bytes),
    /// A close frame; `None` when the peer sent no status code.
    Close(Option<CloseFrame>),
}

/// Assembly buffer for the message in progress.
///
/// Compressed messages accumulate raw deflate output and are inflated (and
/// UTF-8 validated) only at FIN; plain text is validated incrementally.
#[derive(Debug)]
enum Assembly {
    Plain(IncompleteMessage),
    Compressed { kind: IncompleteMessageType, buf: Vec<u8> },
}

impl Assembly {
    fn len(&self) -> usize {
        match self {
            Assembly::Plain(msg) => msg.len(),
            Assembly::Compressed { buf, .. } => buf.len(),
        }
    }
}

/// The inbound frame parser and message reassembler.
///
/// Bytes go in through [`add`](Self::add) at arbitrary chunk boundaries;
/// complete events come out of [`next_event`](Self::next_event). Protocol
/// violations surface as errors from `add`, carrying their close code via
/// [`Error::close_code`].
#[derive(Debug)]
pub struct Receiver {
    role: Role,
    inflater: Option<Inflater>,
    max_payload: Option<usize>,
    max_control_frame_payload: usize,
    max_continuation_frames: usize,
    /// Unconsumed wire bytes.
    buf: BytesMut,
    /// Parsed header waiting for its payload to arrive.
    header: Option<(FrameHeader, u64)>,
    assembly: Option<Assembly>,
    continuation_frames: usize,
    events: VecDeque<Event>,
    bytes_received: u64,
    done: bool,
}

impl Receiver {
    /// Create a receiver for the given role. `inflater` is present iff
    /// permessage-deflate was negotiated.
    pub fn new(role: Role, inflater: Option<Inflater>, config: &EndpointConfig) -> Self {
        Receiver {
            role,
            inflater,
            max_payload: config.max_payload,
            max_control_frame_payload: config.max_control_frame_payload,
            max_continuation_frames: config.max_continuation_frames,
            buf: BytesMut::with_capacity(4096),
            header: None,
            assembly: None,
            continuation_frames: 0,
            events: VecDeque::new(),
            bytes_received: 0,
            done: false,
        }
    }

    /// Total bytes fed into the receiver.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Append a chunk of wire bytes and parse as far as possible.
    ///
    /// Chunks may split frames at any byte boundary; an empty chunk is a
    /// no-op. After [`cleanup`](Self::cleanup), calls are ignored.
    pub fn add(&mut self, chunk: &[u8]) -> Result<()> {
        if self.done || chunk.is_empty() {
            return Ok(());
        }

        self.bytes_received += chunk.len() as u64;
        self.buf.extend_from_slice(chunk);
        self.process()
    }

    /// Pop the next completed event, if any.
    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Release buffers and enter the terminal state.
    pub fn cleanup(&mut self) {
        self.done = true;
        self.buf = BytesMut::new();
        self.header = None;
        self.assembly = None;
        self.inflater = None;
        self.events.clear();
    }

    fn process(&mut self) -> Result<()> {
        loop {
            if self.header.is_none() {
                let mut cursor = Cursor::new(&self.buf);
                match FrameHeader::parse(&mut cursor)? {
                    None => {
                        self.buf.reserve(FrameHeader::MAX_HEADER_SIZE);
                        return Ok(());
                    }
                    Some((header, length)) => {
                        // Validate before consuming the header bytes, so a
                        // rejected frame leaves the buffer at a frame
                        // boundary instead of pointing mid-stream.
                        self.check_header(&header, length)?;
                        let consumed = cursor.position() as usize;
                        Buf::advance(&mut self.buf, consumed);
                        self.buf.reserve((length as usize).saturating_sub(self.buf.len()));
                        self.header = Some((header, length));
                    }
                }
            }

            let length = self.header.as_ref().map(|(_, len)| *len as usize)
                .expect("Bug: no pending frame header");
            if self.buf.len() < length {
                return Ok(());
            }

            let mut payload = self.buf.split_to(length);
            let (mut header, _) = self.header.take().expect("Bug: no pending frame header");

            if let Some(mask) = header.mask.take() {
                apply_mask(&mut payload, mask);
            }

            trace!(
                "frame in: {} fin={} rsv1={} len={}",
                header.opcode, header.fin, header.rsv1, length
            );

            self.dispatch(Frame::new(header, payload.freeze()))?;
        }
    }

    /// Header-time validation: reserved bits, mask direction, fragmentation
    /// preconditions and the declared-size cap, all before any payload is
    /// buffered.
    fn check_header(&self, header: &FrameHeader, length: u64) -> Result<()> {
        if header.rsv2 || header.rsv3 {
            return Err(Error::Protocol(ProtocolError::NonZeroReservedBits));
        }

        match self.role {
            Role::Server if header.mask.is_none() => {
                return Err(Error::Protocol(ProtocolError::UnmaskedFrameFromClient));
            }
            Role::Client if header.mask.is_some() => {
                return Err(Error::Protocol(ProtocolError::MaskedFrameFromServer));
            }
            _ => (),
        }

        match header.opcode {
            OpCode::Control(_) => {
                if header.rsv1 {
                    return Err(Error::Protocol(ProtocolError::NonZeroReservedBits));
                }
                if length as usize > self.max_control_frame_payload {
                    return Err(Error::Protocol(ProtocolError::ControlFrameTooBig));
                }
            }
            OpCode::Data(Data::Continuation) => {
                if header.rsv1 {
                    return Err(Error::Protocol(ProtocolError::CompressedContinuationFrame));
                }
                if self.assembly.is_none() {
                    return Err(Error::Protocol(ProtocolError::UnexpectedContinue));
                }
                self.check_data_size(length)?;
            }
            OpCode::Data(_) => {
                if header.rsv1 && self.inflater.is_none() {
                    return Err(Error::Protocol(ProtocolError::CompressionNotNegotiated));
                }
                if self.assembly.is_some() {
                    return Err(Error::Protocol(ProtocolError::UnexpectedNewMessage));
                }
                self.check_data_size(length)?;
            }
        }

        Ok(())
    }

    fn check_data_size(&self, length: u64) -> Result<()> {
        let Some(max) = self.max_payload else { return Ok(()) };

        let assembled = self.assembly.as_ref().map(Assembly::len).unwrap_or(0);
        let declared = usize::try_from(length)
            .map_err(|_| CapacityError::MessageTooLarge { size: usize::MAX, max })?;

        if assembled > max || declared > max - assembled {
            return Err(Error::Capacity(CapacityError::MessageTooLarge {
                size: assembled.saturating_add(declared),
                max,
            }));
        }

        Ok(())
    }

    fn dispatch(&mut self, frame: Frame) -> Result<()> {
        let header = frame.header().clone();

        match header.opcode {
            OpCode::Control(ctrl) => {
                let event = match ctrl {
                    Control::Ping => Event::Ping(frame.into_payload()),
                    Control::Pong => Event::Pong(frame.into_payload()),
                    Control::Close => Event::Close(frame.into_close()?),
                    Control::Reserved(i) => {
                        return Err(Error::Protocol(ProtocolError::UnknownControlOpCode(i)));
                    }
                };
                self.events.push_back(event);
                Ok(())
            }
            OpCode::Data(Data::Continuation) => {
                self.continuation_frames += 1;
                if self.continuation_frames > self.max_continuation_frames {
                    return Err(Error::Capacity(CapacityError::TooManyContinuationFrames));
                }
                self.append(frame.payload())?;
                if header.fin {
                    self.finalize()?;
                }
                Ok(())
            }
            OpCode::Data(data) => {
                let kind = match data {
                    Data::Text => IncompleteMessageType::Text,
                    Data::Binary => IncompleteMessageType::Binary,
                    // Reserved opcodes never clear the header parser and
                    // continuations are handled above.
                    Data::Continuation | Data::Reserved(_) => {
                        unreachable!("opcode {data:?} reached dispatch")
                    }
                };

                self.assembly = Some(if header.rsv1 {
                    Assembly::Compressed { kind, buf: Vec::new() }
                } else {
                    // Plain text validates UTF-8 as it accumulates.
                    Assembly::Plain(IncompleteMessage::new(kind))
                });
                self.continuation_frames = 0;

                self.append(frame.payload())?;
                if header.fin {
                    self.finalize()?;
                }
                Ok(())
            }
        }
    }

    fn append(&mut self, payload: &[u8]) -> Result<()> {
        let max = self.max_payload;
        match self.assembly.as_mut().expect("Bug: no message in progress") {
            Assembly::Plain(msg) => msg.extend(payload, max),
            Assembly::Compressed { buf, .. } => {
                // The compressed accumulation is bounded too, so a bomb is
                // caught before it ever reaches the inflater.
                if let Some(max) = max {
                    if buf.len() > max || payload.len() > max - buf.len() {
                        return Err(Error::Capacity(CapacityError::MessageTooLarge {
                            size: buf.len().saturating_add(payload.len()),
                            max,
                        }));
                    }
                }
                buf.extend_from_slice(payload);
                Ok(())
            }
        }
    }

    fn finalize(&mut self) -> Result<()> {
        let assembly = self.assembly.take().expect("Bug: no message in progress");
        self.continuation_frames = 0;

        let event = match assembly {
            Assembly::Plain(msg) => match msg.complete()? {
                Message::Text(text) => Event::Text(text),
                Message::Binary(data) => Event::Binary(data),
                other => unreachable!("data assembly produced {other}"),
            },
            Assembly::Compressed { kind, buf } => {
                let inflater =
                    self.inflater.as_mut().expect("Bug: compressed message without inflater");
                let data = inflater.decompress(&buf, self.max_payload)?;

                match kind {
                    IncompleteMessageType::Text => Event::Text(Utf8Bytes::try_from(data)?),
                    IncompleteMessageType::Binary => Event::Binary(data.into()),
                }
            }
        };

        self.events.push_back(event);
        Ok(())
    }
}
