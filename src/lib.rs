#![deny(
    missing_docs,
    missing_copy_implementations,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_must_use,
    unused_mut,
    unused_imports,
    unused_import_braces
)]
//! Riptide: the protocol core of a WebSocket endpoint.
//!
//! Turns an already-upgraded duplex byte stream into a reliable,
//! message-oriented channel per RFC 6455 (versions 8 and 13), with the
//! permessage-deflate extension (RFC 7692). The HTTP upgrade itself is out
//! of scope; construct an [`Endpoint`](protocol::Endpoint) with the
//! upgraded stream, the negotiated extension parameters and any bytes the
//! upgrade left buffered.

use std::time::Duration;

pub mod error;
pub mod extensions;
pub mod protocol;
pub mod util;

/// Default cap on the assembled size of a single message.
pub const MAX_ALLOWED_LEN: usize = 16 * 1024 * 1024;
/// Maximum control frame payload size, fixed by RFC 6455.
pub const MAX_CONTROL_FRAME_PAYLOAD: usize = 125;
/// Default cap on continuation frames per message.
pub const MAX_CONTINUATION_FRAMES: usize = 1024;
/// How long a close handshake may stay unanswered before the connection is
/// torn down.
pub const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

const READ_BUFFER_SIZE: usize = 4096;

pub use bytes::Bytes;

pub use crate::{
    error::{Error, Result},
    protocol::{
        endpoint::{Endpoint, EndpointEvent, ReadyState, SendOptions},
        frame::{CloseCode, CloseFrame, Utf8Bytes},
        message::Message,
        sender::StreamKind,
        EndpointConfig, Role,
    },
};
