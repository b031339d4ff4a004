//! Protocol extensions: the `Sec-WebSocket-Extensions` offer grammar and
//! the permessage-deflate codec.

pub mod deflate;
pub mod params;

pub use self::{
    deflate::{DeflateConfig, Deflater, Inflater, NegotiatedDeflate},
    params::{ExtensionOffer, ExtensionParam},
};
