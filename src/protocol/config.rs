//! Endpoint tuning knobs.

use std::time::Duration;

use crate::{
    extensions::DeflateConfig, CLOSE_HANDSHAKE_TIMEOUT, MAX_ALLOWED_LEN, MAX_CONTINUATION_FRAMES,
    MAX_CONTROL_FRAME_PAYLOAD,
};

/// Limits and timeouts applied by an endpoint.
#[derive(Debug, Clone, Copy)]
pub struct EndpointConfig {
    /// Cap on the assembled size of a single message, in bytes. `None`
    /// disables the check.
    pub max_payload: Option<usize>,
    /// Cap on a control frame payload; the RFC fixes this at 125.
    pub max_control_frame_payload: usize,
    /// Cap on the number of continuation frames in one message.
    pub max_continuation_frames: usize,
    /// How long a locally initiated close waits for the peer's close frame
    /// before the connection is torn down.
    pub close_timeout: Duration,
    /// Local permessage-deflate preferences used during negotiation.
    pub deflate: DeflateConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_payload: Some(MAX_ALLOWED_LEN),
            max_control_frame_payload: MAX_CONTROL_FRAME_PAYLOAD,
            max_continuation_frames: MAX_CONTINUATION_FRAMES,
            close_timeout: CLOSE_HANDSHAKE_TIMEOUT,
            deflate: DeflateConfig::default(),
        }
    }
}
