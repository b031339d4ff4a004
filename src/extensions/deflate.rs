//! Permessage-deflate (RFC 7692): negotiation and the message codec.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use log::debug;

use crate::{
    error::{CapacityError, Error, ExtensionError, Result},
    extensions::params::{ExtensionOffer, ExtensionParam},
    protocol::Role,
};

/// The extension token.
pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Every deflate stream flushed with a sync flush ends with this block; it
/// is stripped before framing and re-appended before inflating.
const TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

const MIN_WINDOW_BITS: u8 = 8;
const MAX_WINDOW_BITS: u8 = 15;

/// Working-buffer granularity for the compress/decompress loops.
const CHUNK: usize = 4096;

/// Local permessage-deflate preferences, used to build offers (client) and
/// to constrain what gets accepted (server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateConfig {
    /// Request that the server drop its compression context between messages.
    pub server_no_context_takeover: bool,
    /// Request that the client drop its compression context between messages.
    pub client_no_context_takeover: bool,
    /// Largest LZ77 window the server side may compress with (8-15).
    pub server_max_window_bits: u8,
    /// Largest LZ77 window the client side may compress with (8-15).
    pub client_max_window_bits: u8,
    /// Deflate compression level, 0-9.
    pub compression_level: u32,
    /// Messages shorter than this are sent uncompressed.
    pub threshold: usize,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: MAX_WINDOW_BITS,
            client_max_window_bits: MAX_WINDOW_BITS,
            compression_level: 6,
            threshold: 1024,
        }
    }
}

/// Whether this build can honor a compression window smaller than 15 bits.
const fn can_reduce_deflate_window() -> bool {
    cfg!(feature = "zlib")
}

/// Parameters both sides agreed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedDeflate {
    /// Server resets its compressor after every message.
    pub server_no_context_takeover: bool,
    /// Client resets its compressor after every message.
    pub client_no_context_takeover: bool,
    /// Window bits for server-to-client compression.
    pub server_max_window_bits: u8,
    /// Window bits for client-to-server compression.
    pub client_max_window_bits: u8,
    /// Compression level for the local deflater.
    pub compression_level: u32,
    /// Local send threshold in bytes.
    pub threshold: usize,
}

impl NegotiatedDeflate {
    /// Build the direction-aware codec pair for an endpoint of the given
    /// role: the deflater gets this side's parameters, the inflater the
    /// peer's.
    pub fn split(&self, role: Role) -> (Deflater, Inflater) {
        let (out_bits, out_reset, in_reset) = match role {
            Role::Server => (
                self.server_max_window_bits,
                self.server_no_context_takeover,
                self.client_no_context_takeover,
            ),
            Role::Client => (
                self.client_max_window_bits,
                self.client_no_context_takeover,
                self.server_no_context_takeover,
            ),
        };

        (
            Deflater::new(self.compression_level, out_bits, out_reset),
            Inflater::new(in_reset),
        )
    }
}

fn parse_window_bits(param: &ExtensionParam) -> Result<u8> {
    let value = param.value.as_deref().ok_or_else(|| ExtensionError::InvalidParameterValue {
        name: param.name.clone(),
        value: String::new(),
    })?;

    // RFC 7692 forbids leading zeros and signs in the decimal value.
    if value.is_empty()
        || value.len() > 2
        || value.starts_with('0')
        || !value.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(ExtensionError::InvalidWindowBits(value.into()).into());
    }

    let bits: u8 = value.parse().map_err(|_| ExtensionError::InvalidWindowBits(value.into()))?;
    if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
        return Err(ExtensionError::InvalidWindowBits(value.into()).into());
    }

    Ok(bits)
}

fn flag_only(param: &ExtensionParam) -> Result<()> {
    if param.value.is_some() {
        return Err(ExtensionError::InvalidParameterValue {
            name: param.name.clone(),
            value: param.value.clone().unwrap_or_default(),
        }
        .into());
    }
    Ok(())
}

fn duplicate(seen: &mut bool, name: &str) -> Result<()> {
    if *seen {
        return Err(ExtensionError::DuplicateParameter(name.into()).into());
    }
    *seen = true;
    Ok(())
}

/// Build the client's offer for the upgrade request.
///
/// Always announces `client_max_window_bits` so the server is free to pick a
/// value; the remaining parameters appear only when the local configuration
/// diverges from the defaults.
pub fn offer(config: &DeflateConfig) -> ExtensionOffer {
    let mut params = Vec::new();

    if config.server_no_context_takeover {
        params.push(ExtensionParam::flag("server_no_context_takeover"));
    }
    if config.client_no_context_takeover {
        params.push(ExtensionParam::flag("client_no_context_takeover"));
    }
    if config.server_max_window_bits < MAX_WINDOW_BITS {
        params.push(ExtensionParam::value(
            "server_max_window_bits",
            config.server_max_window_bits.to_string(),
        ));
    }
    if config.client_max_window_bits < MAX_WINDOW_BITS && can_reduce_deflate_window() {
        params.push(ExtensionParam::value(
            "client_max_window_bits",
            config.client_max_window_bits.to_string(),
        ));
    } else {
        params.push(ExtensionParam::flag("client_max_window_bits"));
    }

    ExtensionOffer { name: EXTENSION_NAME.into(), params }
}

/// Server side: pick the first acceptable `permessage-deflate` offer.
///
/// Returns the agreed parameters plus the response offer to echo back, or
/// `None` when the peer did not offer the extension. An offer with unknown
/// or invalid parameters is rejected; when every offer is rejected the
/// first rejection is returned so the upgrade can be refused.
pub fn negotiate(
    offers: &[ExtensionOffer],
    config: &DeflateConfig,
) -> Result<Option<(NegotiatedDeflate, ExtensionOffer)>> {
    let mut first_rejection = None;
    let mut saw_offer = false;

    for candidate in offers.iter().filter(|o| o.name == EXTENSION_NAME) {
        saw_offer = true;
        match negotiate_one(candidate, config) {
            Ok(agreed) => {
                debug!(
                    "accepted permessage-deflate: server_nct={} client_nct={} swb={} cwb={}",
                    agreed.0.server_no_context_takeover,
                    agreed.0.client_no_context_takeover,
                    agreed.0.server_max_window_bits,
                    agreed.0.client_max_window_bits,
                );
                return Ok(Some(agreed));
            }
            Err(e) => {
                debug!("rejected permessage-deflate offer: {e}");
                first_rejection.get_or_insert(e);
            }
        }
    }

    match (saw_offer, first_rejection) {
        (true, Some(e)) => Err(e),
        _ => Ok(None),
    }
}

fn negotiate_one(
    offer: &ExtensionOffer,
    config: &DeflateConfig,
) -> Result<(NegotiatedDeflate, ExtensionOffer)> {
    let mut server_no_context_takeover = config.server_no_context_takeover;
    let mut client_no_context_takeover = config.client_no_context_takeover;
    let mut server_max_window_bits = None;
    let mut client_max_window_bits = None;
    let mut client_offered_window_bits = false;

    let (mut saw_snct, mut saw_cnct, mut saw_swb, mut saw_cwb) = (false, false, false, false);

    for param in &offer.params {
        match param.name.as_str() {
            "server_no_context_takeover" => {
                duplicate(&mut saw_snct, &param.name)?;
                flag_only(param)?;
                server_no_context_takeover = true;
            }
            "client_no_context_takeover" => {
                duplicate(&mut saw_cnct, &param.name)?;
                flag_only(param)?;
                client_no_context_takeover = true;
            }
            "server_max_window_bits" => {
                duplicate(&mut saw_swb, &param.name)?;
                // A demand on the server's compressor; the value is mandatory
                // in an offer.
                server_max_window_bits = Some(parse_window_bits(param)?);
            }
            "client_max_window_bits" => {
                duplicate(&mut saw_cwb, &param.name)?;
                client_offered_window_bits = true;
                // Valueless in an offer: "pick one for me".
                if param.value.is_some() {
                    client_max_window_bits = Some(parse_window_bits(param)?);
                }
            }
            other => return Err(ExtensionError::UnknownParameter(other.into()).into()),
        }
    }

    let server_bits = server_max_window_bits
        .unwrap_or(MAX_WINDOW_BITS)
        .min(config.server_max_window_bits);
    if server_bits < MAX_WINDOW_BITS && !can_reduce_deflate_window() {
        // We cannot run a reduced compression window; declining the offer is
        // the RFC-sanctioned way out.
        return Err(ExtensionError::InvalidParameterValue {
            name: "server_max_window_bits".into(),
            value: server_bits.to_string(),
        }
        .into());
    }

    // Constrains the client's compressor and only our inflater, which runs a
    // full window regardless, so any agreed value is fine.
    let client_bits = client_max_window_bits
        .unwrap_or(MAX_WINDOW_BITS)
        .min(if client_offered_window_bits {
            config.client_max_window_bits
        } else {
            MAX_WINDOW_BITS
        });

    let agreed = NegotiatedDeflate {
        server_no_context_takeover,
        client_no_context_takeover,
        server_max_window_bits: server_bits,
        client_max_window_bits: client_bits,
        compression_level: config.compression_level,
        threshold: config.threshold,
    };

    let mut response = Vec::new();
    if server_no_context_takeover {
        response.push(ExtensionParam::flag("server_no_context_takeover"));
    }
    if client_no_context_takeover {
        response.push(ExtensionParam::flag("client_no_context_takeover"));
    }
    if server_bits < MAX_WINDOW_BITS {
        response.push(ExtensionParam::value("server_max_window_bits", server_bits.to_string()));
    }
    if client_offered_window_bits && client_bits < MAX_WINDOW_BITS {
        // A response must always carry a value for this parameter.
        response.push(ExtensionParam::value("client_max_window_bits", client_bits.to_string()));
    }

    Ok((agreed, ExtensionOffer { name: EXTENSION_NAME.into(), params: response }))
}

/// Client side: validate the server's response against what we offered.
pub fn accept(response: &ExtensionOffer, config: &DeflateConfig) -> Result<NegotiatedDeflate> {
    if response.name != EXTENSION_NAME {
        return Err(ExtensionError::MalformedHeader(format!(
            "expected {EXTENSION_NAME}, got {}",
            response.name
        ))
        .into());
    }

    let mut server_no_context_takeover = config.server_no_context_takeover;
    let mut client_no_context_takeover = config.client_no_context_takeover;
    let mut server_max_window_bits = MAX_WINDOW_BITS;
    let mut client_max_window_bits = MAX_WINDOW_BITS;

    let (mut saw_snct, mut saw_cnct, mut saw_swb, mut saw_cwb) = (false, false, false, false);

    for param in &response.params {
        match param.name.as_str() {
            "server_no_context_takeover" => {
                duplicate(&mut saw_snct, &param.name)?;
                flag_only(param)?;
                server_no_context_takeover = true;
            }
            "client_no_context_takeover" => {
                duplicate(&mut saw_cnct, &param.name)?;
                flag_only(param)?;
                client_no_context_takeover = true;
            }
            "server_max_window_bits" => {
                duplicate(&mut saw_swb, &param.name)?;
                server_max_window_bits = parse_window_bits(param)?;
            }
            "client_max_window_bits" => {
                duplicate(&mut saw_cwb, &param.name)?;
                // The valueless form is only meaningful in an offer.
                let bits = parse_window_bits(param)?;
                if bits > config.client_max_window_bits
                    || (bits < MAX_WINDOW_BITS && !can_reduce_deflate_window())
                {
                    return Err(ExtensionError::InvalidWindowBits(bits.to_string()).into());
                }
                client_max_window_bits = bits;
            }
            other => return Err(ExtensionError::UnknownParameter(other.into()).into()),
        }
    }

    debug!(
        "permessage-deflate agreed: server_nct={server_no_context_takeover} \
         client_nct={client_no_context_takeover} swb={server_max_window_bits} \
         cwb={client_max_window_bits}"
    );

    Ok(NegotiatedDeflate {
        server_no_context_takeover,
        client_no_context_takeover,
        server_max_window_bits,
        client_max_window_bits,
        compression_level: config.compression_level,
        threshold: config.threshold,
    })
}

/// Outbound half of the codec: a raw deflate stream with optional context
/// reset between messages.
pub struct Deflater {
    ctx: Compress,
    reset_after_message: bool,
}

impl std::fmt::Debug for Deflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deflater")
            .field("reset_after_message", &self.reset_after_message)
            .finish_non_exhaustive()
    }
}

impl Deflater {
    fn new(level: u32, window_bits: u8, reset_after_message: bool) -> Self {
        debug_assert!(
            window_bits == MAX_WINDOW_BITS || can_reduce_deflate_window(),
            "reduced window negotiated without zlib support"
        );

        #[cfg(feature = "zlib")]
        let ctx = Compress::new_with_window_bits(Compression::new(level), false, window_bits);
        #[cfg(not(feature = "zlib"))]
        let ctx = {
            let _ = window_bits;
            Compress::new(Compression::new(level), false)
        };

        Deflater { ctx, reset_after_message }
    }

    /// Compress one whole message payload.
    ///
    /// The output is the sync-flushed deflate stream with the trailing
    /// `00 00 FF FF` removed, ready to be framed with RSV1 set.
    pub fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2 + CHUNK.min(64));
        let mut pos = 0;

        loop {
            let before_in = self.ctx.total_in();
            let before_out = self.ctx.total_out();
            let old_len = out.len();
            out.resize(old_len + CHUNK, 0);

            let flush =
                if pos < data.len() { FlushCompress::None } else { FlushCompress::Sync };

            self.ctx
                .compress(&data[pos..], &mut out[old_len..], flush)
                .map_err(|e| ExtensionError::Deflate(e.to_string()))?;

            pos += (self.ctx.total_in() - before_in) as usize;
            let produced = (self.ctx.total_out() - before_out) as usize;
            out.truncate(old_len + produced);

            // A sync flush is complete once it no longer fills the buffer.
            if pos == data.len() && matches!(flush, FlushCompress::Sync) && produced < CHUNK {
                break;
            }
        }

        if out.ends_with(&TRAILER) {
            out.truncate(out.len() - TRAILER.len());
        }

        if self.reset_after_message {
            self.ctx.reset();
        }

        Ok(out)
    }
}

/// Inbound half of the codec.
///
/// Always inflates with a full 15-bit window, which accepts any stream
/// produced under a smaller negotiated window.
pub struct Inflater {
    ctx: Decompress,
    reset_after_message: bool,
}

impl std::fmt::Debug for Inflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inflater")
            .field("reset_after_message", &self.reset_after_message)
            .finish_non_exhaustive()
    }
}

impl Inflater {
    fn new(reset_after_message: bool) -> Self {
        Inflater { ctx: Decompress::new(false), reset_after_message }
    }

    /// Inflate one whole message payload, enforcing `limit` on the output.
    pub fn decompress(&mut self, data: &[u8], limit: Option<usize>) -> Result<Vec<u8>> {
        let mut input = Vec::with_capacity(data.len() + TRAILER.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&TRAILER);

        let max = limit.unwrap_or(usize::MAX);
        let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(CHUNK));
        let mut pos = 0;

        loop {
            let before_in = self.ctx.total_in();
            let before_out = self.ctx.total_out();
            let old_len = out.len();
            out.resize(old_len + CHUNK, 0);

            let status = self
                .ctx
                .decompress(&input[pos..], &mut out[old_len..], FlushDecompress::Sync)
                .map_err(|e| ExtensionError::Inflate(e.to_string()))?;

            pos += (self.ctx.total_in() - before_in) as usize;
            let produced = (self.ctx.total_out() - before_out) as usize;
            out.truncate(old_len + produced);

            if out.len() > max {
                return Err(Error::Capacity(CapacityError::MessageTooLarge {
                    size: out.len(),
                    max,
                }));
            }

            if status == flate2::Status::StreamEnd || (pos == input.len() && produced < CHUNK) {
                break;
            }
        }

        if self.reset_after_message {
            self.ctx.reset(false);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::extensions::params::parse_offers;

    fn session() -> (Deflater, Inflater) {
        let agreed = NegotiatedDeflate {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: 15,
            client_max_window_bits: 15,
            compression_level: 6,
            threshold: 0,
        };
        let (deflater, _) = agreed.split(Role::Client);
        let (_, inflater) = agreed.split(Role::Server);
        (deflater, inflater)
    }

    #[test]
    fn compress_roundtrip() {
        let (mut deflater, mut inflater) = session();

        for payload in [
            b"Hello, compression!".to_vec(),
            vec![b'a'; 2048],
            (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect::<Vec<u8>>(),
        ] {
            let compressed = deflater.compress(&payload).unwrap();
            assert!(!compressed.ends_with(&TRAILER));

            let inflated = inflater.decompress(&compressed, None).unwrap();
            assert_eq!(inflated, payload);
        }
    }

    #[test]
    fn repetitive_input_shrinks() {
        let (mut deflater, _) = session();
        let compressed = deflater.compress(&vec![b'a'; 2048]).unwrap();
        assert!(compressed.len() < 2048);
    }

    #[test]
    fn context_takeover_carries_across_messages() {
        let (mut deflater, mut inflater) = session();
        let message = b"The quick brown fox jumps over the lazy dog. ".repeat(8);

        let first = deflater.compress(&message).unwrap();
        assert_eq!(inflater.decompress(&first, None).unwrap(), message);

        let second = deflater.compress(&message).unwrap();
        assert!(second.len() <= first.len());
        assert_eq!(inflater.decompress(&second, None).unwrap(), message);
    }

    #[test]
    fn no_context_takeover_resets_between_messages() {
        let agreed = NegotiatedDeflate {
            server_no_context_takeover: true,
            client_no_context_takeover: true,
            server_max_window_bits: 15,
            client_max_window_bits: 15,
            compression_level: 6,
            threshold: 0,
        };
        let (mut deflater, _) = agreed.split(Role::Client);
        let (_, mut inflater) = agreed.split(Role::Server);

        let message = b"The quick brown fox jumps over the lazy dog. ".repeat(8);

        let first = deflater.compress(&message).unwrap();
        assert_eq!(inflater.decompress(&first, None).unwrap(), message);

        let second = deflater.compress(&message).unwrap();
        assert_eq!(first, second);
        assert_eq!(inflater.decompress(&second, None).unwrap(), message);
    }

    #[test]
    fn inflate_enforces_limit() {
        let (mut deflater, mut inflater) = session();
        let compressed = deflater.compress(&vec![0u8; 8192]).unwrap();

        let err = inflater.decompress(&compressed, Some(1024)).unwrap_err();
        assert!(matches!(err, Error::Capacity(CapacityError::MessageTooLarge { .. })));
    }

    #[test]
    fn inflate_rejects_garbage() {
        let (_, mut inflater) = session();
        assert!(matches!(
            inflater.decompress(&[0xFF, 0x13, 0x37, 0xFF, 0xAB], None),
            Err(Error::Extension(ExtensionError::Inflate(_)))
        ));
    }

    #[test]
    fn negotiate_plain_offer() {
        let offers = parse_offers("permessage-deflate; client_max_window_bits").unwrap();
        let (agreed, response) = negotiate(&offers, &DeflateConfig::default()).unwrap().unwrap();

        assert!(!agreed.server_no_context_takeover);
        assert!(!agreed.client_no_context_takeover);
        assert_eq!(agreed.server_max_window_bits, 15);
        assert_eq!(agreed.client_max_window_bits, 15);
        assert!(response.params.is_empty());
    }

    #[test]
    fn negotiate_echoes_context_takeover() {
        let offers =
            parse_offers("permessage-deflate; server_no_context_takeover; client_no_context_takeover")
                .unwrap();
        let (agreed, response) = negotiate(&offers, &DeflateConfig::default()).unwrap().unwrap();

        assert!(agreed.server_no_context_takeover);
        assert!(agreed.client_no_context_takeover);
        assert!(response.params.iter().any(|p| p.name == "server_no_context_takeover"));
        assert!(response.params.iter().any(|p| p.name == "client_no_context_takeover"));
    }

    #[test]
    fn negotiate_rejects_unknown_parameter() {
        let offers = parse_offers("permessage-deflate; frobnicate").unwrap();
        assert!(negotiate(&offers, &DeflateConfig::default()).is_err());
    }

    #[test]
    fn negotiate_rejects_out_of_range_window_bits() {
        for header in [
            "permessage-deflate; server_max_window_bits=7",
            "permessage-deflate; server_max_window_bits=16",
            "permessage-deflate; client_max_window_bits=100",
            "permessage-deflate; server_max_window_bits",
        ] {
            let offers = parse_offers(header).unwrap();
            assert!(negotiate(&offers, &DeflateConfig::default()).is_err(), "{header}");
        }
    }

    #[test]
    fn negotiate_rejects_duplicate_parameter() {
        let offers = parse_offers(
            "permessage-deflate; server_no_context_takeover; server_no_context_takeover",
        )
        .unwrap();
        assert!(negotiate(&offers, &DeflateConfig::default()).is_err());
    }

    #[test]
    fn negotiate_falls_back_to_second_offer() {
        let offers = parse_offers("permessage-deflate; frobnicate, permessage-deflate").unwrap();
        let (_, response) = negotiate(&offers, &DeflateConfig::default()).unwrap().unwrap();
        assert!(response.params.is_empty());
    }

    #[test]
    fn negotiate_without_offer_is_none() {
        let offers = parse_offers("x-webkit-whatever").unwrap();
        assert!(negotiate(&offers, &DeflateConfig::default()).unwrap().is_none());
    }

    #[test]
    fn accept_requires_valued_client_window_bits() {
        let response = ExtensionOffer {
            name: EXTENSION_NAME.into(),
            params: vec![ExtensionParam::flag("client_max_window_bits")],
        };
        assert!(accept(&response, &DeflateConfig::default()).is_err());
    }

    #[test]
    fn accept_applies_server_flags() {
        let response = ExtensionOffer {
            name: EXTENSION_NAME.into(),
            params: vec![ExtensionParam::flag("server_no_context_takeover")],
        };
        let agreed = accept(&response, &DeflateConfig::default()).unwrap();
        assert!(agreed.server_no_context_takeover);
        assert!(!agreed.client_no_context_takeover);
    }

    #[test]
    fn client_offer_announces_window_bits_support() {
        let offer = offer(&DeflateConfig::default());
        assert_eq!(offer.name, EXTENSION_NAME);
        assert!(offer
            .params
            .iter()
            .any(|p| p.name == "client_max_window_bits" && p.value.is_none()));
    }
}
