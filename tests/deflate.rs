//! End-to-end permessage-deflate: header negotiation, compressed traffic,
//! thresholds and inflate-side limits.

use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{self, Read, Write},
    rc::Rc,
};

use riptide::{
    error::{CapacityError, Error},
    extensions::{
        deflate::{self, DeflateConfig, NegotiatedDeflate},
        params::{format_offers, parse_offers},
    },
    protocol::{Endpoint, EndpointConfig, EndpointEvent, Message, Role},
    SendOptions,
};

#[derive(Debug, Default)]
struct Channel {
    data: VecDeque<u8>,
    eof: bool,
}

#[derive(Debug)]
struct Pipe {
    incoming: Rc<RefCell<Channel>>,
    outgoing: Rc<RefCell<Channel>>,
}

fn pipe_pair() -> (Pipe, Pipe) {
    let a = Rc::new(RefCell::new(Channel::default()));
    let b = Rc::new(RefCell::new(Channel::default()));
    (
        Pipe { incoming: a.clone(), outgoing: b.clone() },
        Pipe { incoming: b, outgoing: a },
    )
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut chan = self.incoming.borrow_mut();
        if chan.data.is_empty() {
            if chan.eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let n = buf.len().min(chan.data.len());
        for slot in buf[..n].iter_mut() {
            *slot = chan.data.pop_front().expect("queue drained early");
        }
        Ok(n)
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.borrow_mut().data.extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run the full negotiation through the header grammar, the way the
/// (out-of-scope) upgrade layer would: client offer -> header -> server
/// accept -> response header -> client verify.
fn negotiate_via_headers(
    client_config: &DeflateConfig,
    server_config: &DeflateConfig,
) -> (NegotiatedDeflate, NegotiatedDeflate) {
    let offer_header = format_offers(&[deflate::offer(client_config)]);

    let offers = parse_offers(&offer_header).unwrap();
    let (server_agreed, response) =
        deflate::negotiate(&offers, server_config).unwrap().expect("offer must be accepted");

    let response_header = format_offers(std::slice::from_ref(&response));
    let parsed = parse_offers(&response_header).unwrap();
    let client_agreed = deflate::accept(&parsed[0], client_config).unwrap();

    (client_agreed, server_agreed)
}

fn open_pair(config: EndpointConfig) -> (Endpoint<Pipe>, Endpoint<Pipe>) {
    let (client_agreed, server_agreed) =
        negotiate_via_headers(&config.deflate, &config.deflate);

    let (client_pipe, server_pipe) = pipe_pair();
    let mut client = Endpoint::new(client_pipe, Role::Client, Some(client_agreed), config.clone());
    let mut server = Endpoint::new(server_pipe, Role::Server, Some(server_agreed), config);
    client.open(&[]).unwrap();
    server.open(&[]).unwrap();
    assert_eq!(client.poll_event().unwrap(), Some(EndpointEvent::Open));
    assert_eq!(server.poll_event().unwrap(), Some(EndpointEvent::Open));
    (client, server)
}

fn drain(endpoint: &mut Endpoint<Pipe>) -> (Vec<EndpointEvent>, Option<Error>) {
    let mut events = Vec::new();
    loop {
        match endpoint.poll_event() {
            Ok(Some(event)) => {
                let closed = matches!(event, EndpointEvent::Close { .. });
                events.push(event);
                if closed {
                    return (events, None);
                }
            }
            Ok(None) => return (events, None),
            Err(e) => return (events, Some(e)),
        }
    }
}

#[test]
fn compressed_text_message() {
    let (mut client, mut server) = open_pair(EndpointConfig::default());
    let text = "a".repeat(2048);

    client.send(Message::text(text.as_str())).unwrap();

    // Inspect the frame before the server consumes it: FIN=1, RSV1=1,
    // opcode=1, masked, and the compressed payload is far shorter than the
    // original (and lacks the 00 00 FF FF trailer, which masking aside
    // would make the length 4 bytes longer).
    {
        let wire = &client.get_ref().outgoing.borrow().data;
        assert_eq!(wire[0], 0xC1);
        assert_eq!(wire[1] & 0x80, 0x80);
        let payload_len = (wire[1] & 0x7F) as usize;
        assert!(payload_len < 126, "2KB of 'a' must compress into the 7-bit length form");
        assert!(payload_len < 2048);
    }

    let (events, err) = drain(&mut server);
    assert!(err.is_none());
    assert_eq!(events, vec![EndpointEvent::Message(Message::text(text.as_str()))]);
}

#[test]
fn compression_round_trip_both_directions() {
    let (mut client, mut server) = open_pair(EndpointConfig::default());

    let messages = [
        Message::text("The quick brown fox jumps over the lazy dog. ".repeat(40).as_str()),
        Message::binary((0..16384u32).flat_map(|i| i.to_le_bytes()).collect::<Vec<u8>>()),
        Message::text("short"),
    ];

    for message in &messages {
        client.send(message.clone()).unwrap();
        let (events, err) = drain(&mut server);
        assert!(err.is_none());
        assert_eq!(events, vec![EndpointEvent::Message(message.clone())]);

        server.send(message.clone()).unwrap();
        let (events, err) = drain(&mut client);
        assert!(err.is_none());
        assert_eq!(events, vec![EndpointEvent::Message(message.clone())]);
    }
}

#[test]
fn threshold_keeps_small_messages_uncompressed() {
    let (mut client, mut server) = open_pair(EndpointConfig::default());

    client.send(Message::text("hi")).unwrap();
    {
        let wire = &client.get_ref().outgoing.borrow().data;
        assert_eq!(wire[0], 0x81, "below-threshold message must not set RSV1");
    }
    let (events, _) = drain(&mut server);
    assert_eq!(events, vec![EndpointEvent::Message(Message::text("hi"))]);
}

#[test]
fn compression_can_be_declined_per_send() {
    let (mut client, mut server) = open_pair(EndpointConfig::default());
    let text = "b".repeat(4096);

    client
        .send_with(Message::text(text.as_str()), SendOptions { compress: false })
        .unwrap();
    {
        let wire = &client.get_ref().outgoing.borrow().data;
        assert_eq!(wire[0], 0x81);
    }
    let (events, _) = drain(&mut server);
    assert_eq!(events, vec![EndpointEvent::Message(Message::text(text.as_str()))]);
}

#[test]
fn inflate_respects_max_payload() {
    let config = EndpointConfig { max_payload: Some(1024), ..Default::default() };
    let (mut client, mut server) = open_pair(config);

    // Compresses to well under 1024 bytes, inflates to 16K: the limit must
    // trip while inflating.
    client.send(Message::text("a".repeat(16384).as_str())).unwrap();

    let (events, err) = drain(&mut server);
    assert!(events.is_empty());
    assert!(matches!(
        err,
        Some(Error::Capacity(CapacityError::MessageTooLarge { .. }))
    ));
}

#[test]
fn no_context_takeover_end_to_end() {
    let config = EndpointConfig {
        deflate: DeflateConfig {
            server_no_context_takeover: true,
            client_no_context_takeover: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let (mut client, mut server) = open_pair(config);

    let text = "repetition repetition repetition ".repeat(64);
    for _ in 0..3 {
        client.send(Message::text(text.as_str())).unwrap();
        let (events, err) = drain(&mut server);
        assert!(err.is_none());
        assert_eq!(events, vec![EndpointEvent::Message(Message::text(text.as_str()))]);
    }
}

#[test]
fn negotiation_headers_echo_agreed_parameters() {
    let client_config = DeflateConfig {
        server_no_context_takeover: true,
        client_no_context_takeover: true,
        ..Default::default()
    };
    let (client_agreed, server_agreed) =
        negotiate_via_headers(&client_config, &DeflateConfig::default());

    assert_eq!(client_agreed, server_agreed);
    assert!(client_agreed.server_no_context_takeover);
    assert!(client_agreed.client_no_context_takeover);
    assert_eq!(client_agreed.server_max_window_bits, 15);
    assert_eq!(client_agreed.client_max_window_bits, 15);
}

#[test]
fn fragmented_compressed_message_from_peer() {
    // Hand-roll a compressed message split over two frames: RSV1 on the
    // opening frame only, continuation carries the rest. The receiver must
    // reassemble before inflating.
    let agreed = NegotiatedDeflate {
        server_no_context_takeover: false,
        client_no_context_takeover: false,
        server_max_window_bits: 15,
        client_max_window_bits: 15,
        compression_level: 6,
        threshold: 0,
    };
    let (mut deflater, _) = agreed.split(Role::Server);

    let text = "fragmented but compressed ".repeat(100);
    let compressed = deflater.compress(text.as_bytes()).unwrap();
    assert!(compressed.len() < 250, "test payload must fit two 7-bit-length frames");
    let split = compressed.len() / 2;

    let mut wire = Vec::new();
    wire.extend_from_slice(&[0x41, split as u8]); // text, RSV1, FIN clear
    wire.extend_from_slice(&compressed[..split]);
    let rest = compressed.len() - split;
    wire.extend_from_slice(&[0x80, rest as u8]); // continuation, FIN
    wire.extend_from_slice(&compressed[split..]);

    let (client_pipe, server_pipe) = pipe_pair();
    drop(server_pipe);
    let mut client = Endpoint::new(client_pipe, Role::Client, Some(agreed), EndpointConfig::default());
    client.open(&wire).unwrap();

    let (events, err) = drain(&mut client);
    assert!(err.is_none());
    assert_eq!(
        events,
        vec![
            EndpointEvent::Open,
            EndpointEvent::Message(Message::text(text.as_str())),
        ]
    );
}
