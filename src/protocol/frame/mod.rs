//! Frame layer: wire codes, header codec, masking, UTF-8 payloads.

pub mod codec;

#[allow(clippy::module_inception)]
mod frame;
mod mask;
mod utf;

pub use self::{
    codec::{CloseCode, Control, Data, OpCode},
    frame::{CloseFrame, Frame, FrameHeader},
    mask::{apply_mask, generate as generate_mask},
    utf::Utf8Bytes,
};
