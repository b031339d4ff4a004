//! Logical messages and incremental message assembly.

use bytes::Bytes;

use crate::{
    error::{CapacityError, Error, Result},
    protocol::{
        frame::{CloseFrame, Utf8Bytes},
        message::string_lib::StringCollector,
    },
};

mod string_lib {
    use crate::error::{Error, Result};
    use utf8::DecodeError;

    /// Collects text payload chunks, validating UTF-8 incrementally so a
    /// bad sequence fails as soon as it arrives rather than at FIN.
    #[derive(Debug)]
    pub struct StringCollector {
        data: String,
        incomplete: Option<utf8::Incomplete>,
    }

    impl StringCollector {
        pub fn new() -> Self {
            StringCollector { data: String::new(), incomplete: None }
        }

        pub fn len(&self) -> usize {
            self.data
                .len()
                .saturating_add(self.incomplete.map(|i| i.buffer_len as usize).unwrap_or(0))
        }

        pub fn extend<T: AsRef<[u8]>>(&mut self, tail: T) -> Result<()> {
            let mut input: &[u8] = tail.as_ref();

            if let Some(mut incomplete) = self.incomplete.take() {
                if let Some((result, remaining)) = incomplete.try_complete(input) {
                    input = remaining;

                    match result {
                        Ok(s) => self.data.push_str(s),
                        Err(bad) => {
                            return Err(Error::Utf8(String::from_utf8_lossy(bad).into()))
                        }
                    }
                } else {
                    input = &[];
                    self.incomplete = Some(incomplete);
                }
            }

            if input.is_empty() {
                return Ok(());
            }

            match utf8::decode(input) {
                Ok(s) => {
                    self.data.push_str(s);
                    Ok(())
                }
                Err(DecodeError::Incomplete { valid_prefix, incomplete_suffix }) => {
                    self.data.push_str(valid_prefix);
                    self.incomplete = Some(incomplete_suffix);
                    Ok(())
                }
                Err(DecodeError::Invalid { valid_prefix, invalid_sequence, .. }) => {
                    self.data.push_str(valid_prefix);
                    Err(Error::Utf8(String::from_utf8_lossy(invalid_sequence).into()))
                }
            }
        }

        pub fn into_string(self) -> Result<String> {
            if let Some(incomplete) = self.incomplete {
                Err(Error::Utf8(format!("Incomplete string: {:?}", incomplete)))
            } else {
                Ok(self.data)
            }
        }
    }
}

/// A message being assembled from data frames.
#[derive(Debug)]
pub struct IncompleteMessage {
    collector: IncompleteMessageCollector,
}

#[derive(Debug)]
enum IncompleteMessageCollector {
    Text(StringCollector),
    Binary(Vec<u8>),
}

/// Which kind of message is being assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncompleteMessageType {
    /// A text message; payload is UTF-8 validated as it accumulates.
    Text,
    /// A binary message.
    Binary,
}

impl IncompleteMessage {
    /// Start assembling a message of the given kind.
    pub fn new(msg_type: IncompleteMessageType) -> Self {
        IncompleteMessage {
            collector: match msg_type {
                IncompleteMessageType::Binary => IncompleteMessageCollector::Binary(Vec::new()),
                IncompleteMessageType::Text => {
                    IncompleteMessageCollector::Text(StringCollector::new())
                }
            },
        }
    }

    /// Bytes accumulated so far.
    pub fn len(&self) -> usize {
        match self.collector {
            IncompleteMessageCollector::Binary(ref b) => b.len(),
            IncompleteMessageCollector::Text(ref t) => t.len(),
        }
    }

    /// Whether nothing has accumulated yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a frame payload, enforcing the size cap.
    pub fn extend<T: AsRef<[u8]>>(&mut self, tail: T, limit: Option<usize>) -> Result<()> {
        let max = limit.unwrap_or(usize::MAX);
        let size = self.len();
        let portion = tail.as_ref().len();

        if size > max || portion > max - size {
            return Err(Error::Capacity(CapacityError::MessageTooLarge {
                size: size + portion,
                max,
            }));
        }

        match self.collector {
            IncompleteMessageCollector::Binary(ref mut b) => {
                b.extend_from_slice(tail.as_ref());
                Ok(())
            }
            IncompleteMessageCollector::Text(ref mut t) => t.extend(tail),
        }
    }

    /// Finalize into a complete message.
    pub fn complete(self) -> Result<Message> {
        match self.collector {
            IncompleteMessageCollector::Binary(b) => Ok(Message::Binary(b.into())),
            IncompleteMessageCollector::Text(t) => {
                let text = t.into_string()?;
                Ok(Message::Text(text.into()))
            }
        }
    }
}

/// A complete WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A text message.
    Text(Utf8Bytes),
    /// A binary message.
    Binary(Bytes),
    /// A ping with its application payload.
    Ping(Bytes),
    /// A pong with its application payload.
    Pong(Bytes),
    /// A close, with the optional decoded code and reason.
    Close(Option<CloseFrame>),
}

impl Message {
    /// Create a text message.
    pub fn text<S>(string: S) -> Message
    where
        S: Into<Utf8Bytes>,
    {
        Message::Text(string.into())
    }

    /// Create a binary message.
    pub fn binary<B>(binary: B) -> Message
    where
        B: Into<Bytes>,
    {
        Message::Binary(binary.into())
    }

    /// Whether this is a control message (ping, pong or close).
    pub fn is_control(&self) -> bool {
        matches!(self, Message::Ping(_) | Message::Pong(_) | Message::Close(_))
    }

    /// Whether this is a data message (text or binary).
    pub fn is_data(&self) -> bool {
        matches!(self, Message::Text(_) | Message::Binary(_))
    }

    /// Whether this is a text message.
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    /// Whether this is a binary message.
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match *self {
            Message::Text(ref s) => s.len(),
            Message::Binary(ref b) | Message::Ping(ref b) | Message::Pong(ref b) => b.len(),
            Message::Close(ref frame) => frame.as_ref().map(|f| f.reason.len() + 2).unwrap_or(0),
        }
    }

    /// Whether the message carries no payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the message into its payload bytes.
    pub fn into_data(self) -> Bytes {
        match self {
            Self::Text(s) => s.into(),
            Self::Binary(b) | Self::Ping(b) | Self::Pong(b) => b,
            Self::Close(None) => <_>::default(),
            Self::Close(Some(frame)) => frame.reason.into(),
        }
    }
}

impl From<String> for Message {
    #[inline]
    fn from(value: String) -> Self {
        Message::text(value)
    }
}

impl<'s> From<&'s str> for Message {
    #[inline]
    fn from(value: &'s str) -> Self {
        Message::text(value)
    }
}

impl<'b> From<&'b [u8]> for Message {
    #[inline]
    fn from(value: &'b [u8]) -> Self {
        Message::binary(Bytes::copy_from_slice(value))
    }
}

impl From<Vec<u8>> for Message {
    #[inline]
    fn from(value: Vec<u8>) -> Self {
        Message::binary(value)
    }
}

impl From<Bytes> for Message {
    #[inline]
    fn from(value: Bytes) -> Self {
        Message::binary(value)
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Text(s) => write!(f, "Text({})", s),
            Message::Binary(b) => write!(f, "Binary({} bytes)", b.len()),
            Message::Ping(_) => write!(f, "Ping"),
            Message::Pong(_) => write!(f, "Pong"),
            Message::Close(Some(frame)) => write!(f, "Close({}, {})", frame.code, frame.reason),
            Message::Close(None) => write!(f, "Close"),
        }
    }
}
