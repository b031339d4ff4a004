//! Outbound half: turns logical sends into framed, masked, optionally
//! compressed bytes.

use bytes::Bytes;
use log::trace;

use crate::{
    error::{Error, ProtocolError, Result},
    extensions::Deflater,
    protocol::{
        frame::{CloseFrame, Data, Frame, OpCode},
        message::Message,
        Role,
    },
    MAX_CONTROL_FRAME_PAYLOAD,
};

/// Kind of a streamed (fragmented) outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Fragments form a text message; the caller supplies valid UTF-8.
    Text,
    /// Fragments form a binary message.
    Binary,
}

impl StreamKind {
    fn opcode(self) -> OpCode {
        match self {
            StreamKind::Text => OpCode::Data(Data::Text),
            StreamKind::Binary => OpCode::Data(Data::Binary),
        }
    }
}

/// The outbound framer.
///
/// Client endpoints mask every frame with a fresh random key; server
/// endpoints never mask. Compression applies only to whole messages at or
/// above the negotiated threshold; streamed messages always go out
/// uncompressed.
#[derive(Debug)]
pub struct Sender {
    role: Role,
    deflater: Option<Deflater>,
    threshold: usize,
    /// Streamed message in progress: kind plus whether the opening frame
    /// has been emitted.
    stream: Option<(StreamKind, bool)>,
}

impl Sender {
    /// Create a sender for the given role. `deflater` is present iff
    /// permessage-deflate was negotiated.
    pub fn new(role: Role, deflater: Option<Deflater>, threshold: usize) -> Self {
        Sender { role, deflater, threshold, stream: None }
    }

    /// Whether a streamed message is currently open.
    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    /// Frame a complete message and append the wire bytes to `out`.
    ///
    /// `compress` asks for permessage-deflate; it is honored when the
    /// extension was negotiated and the payload reaches the threshold.
    pub fn send_message(&mut self, message: Message, compress: bool, out: &mut Vec<u8>) -> Result<()> {
        match message {
            Message::Text(text) => {
                self.data_frame(text.into(), StreamKind::Text.opcode(), compress, out)
            }
            Message::Binary(data) => {
                self.data_frame(data, StreamKind::Binary.opcode(), compress, out)
            }
            Message::Ping(data) => self.ping(data, out),
            Message::Pong(data) => self.pong(data, out),
            Message::Close(frame) => self.close(frame, out),
        }
    }

    /// Open a streamed message. Fails while another stream is open.
    pub fn start_stream(&mut self, kind: StreamKind) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::Protocol(ProtocolError::FragmentOutOfSequence));
        }
        self.stream = Some((kind, false));
        Ok(())
    }

    /// Emit the next fragment of the open stream; `fin` closes it.
    ///
    /// The opening fragment carries the data opcode, later ones the
    /// continuation opcode. An empty `payload` with `fin` produces the
    /// bare FIN-only continuation that finishes a stream with no trailing
    /// data.
    pub fn stream_frame(&mut self, payload: &[u8], fin: bool, out: &mut Vec<u8>) -> Result<()> {
        let (kind, started) = self
            .stream
            .ok_or(Error::Protocol(ProtocolError::FragmentOutOfSequence))?;

        let opcode = if started { OpCode::Data(Data::Continuation) } else { kind.opcode() };

        if fin {
            self.stream = None;
        } else {
            self.stream = Some((kind, true));
        }

        self.write_frame(Frame::message(Bytes::copy_from_slice(payload), opcode, fin), out);
        Ok(())
    }

    /// Frame a ping.
    pub fn ping(&mut self, data: Bytes, out: &mut Vec<u8>) -> Result<()> {
        self.control_payload_check(&data)?;
        self.write_frame(Frame::ping(data), out);
        Ok(())
    }

    /// Frame a pong.
    pub fn pong(&mut self, data: Bytes, out: &mut Vec<u8>) -> Result<()> {
        self.control_payload_check(&data)?;
        self.write_frame(Frame::pong(data), out);
        Ok(())
    }

    /// Frame a close.
    pub fn close(&mut self, frame: Option<CloseFrame>, out: &mut Vec<u8>) -> Result<()> {
        if let Some(ref frame) = frame {
            if !frame.code.is_sendable() {
                return Err(Error::Protocol(ProtocolError::DisallowedCloseCode(frame.code.into())));
            }
            // The payload is the 2-byte code plus the reason, capped at 125
            // bytes like any other control frame.
            if 2 + frame.reason.len() > MAX_CONTROL_FRAME_PAYLOAD {
                return Err(Error::Protocol(ProtocolError::ControlFrameTooBig));
            }
        }
        self.write_frame(Frame::close(frame), out);
        Ok(())
    }

    fn data_frame(
        &mut self,
        payload: Bytes,
        opcode: OpCode,
        compress: bool,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::Protocol(ProtocolError::FragmentOutOfSequence));
        }

        let compress = compress && !payload.is_empty() && payload.len() >= self.threshold;
        if let (true, Some(deflater)) = (compress, self.deflater.as_mut()) {
            let before = payload.len();
            let compressed = deflater.compress(&payload)?;
            trace!("compressed outbound message: {before} -> {} bytes", compressed.len());

            let mut frame = Frame::message(compressed, opcode, true);
            frame.header_mut().rsv1 = true;
            self.write_frame(frame, out);
            return Ok(());
        }

        self.write_frame(Frame::message(payload, opcode, true), out);
        Ok(())
    }

    fn control_payload_check(&self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_CONTROL_FRAME_PAYLOAD {
            return Err(Error::Protocol(ProtocolError::ControlFrameTooBig));
        }
        Ok(())
    }

    fn write_frame(&mut self, mut frame: Frame, out: &mut Vec<u8>) {
        if self.role == Role::Client {
            frame.set_random_mask();
        }
        frame.write_into(out);
    }
}
