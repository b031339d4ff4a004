//! Helpers for working with non-blocking sockets.

use std::io;

use crate::error::Error;

/// Turns a `WouldBlock` outcome into `Ok(None)`, leaving real errors alone.
pub trait NonBlockingResult {
    /// Success type of the converted result.
    type Value;

    /// Perform the conversion.
    fn no_block(self) -> Result<Option<Self::Value>, Error>;
}

impl<T> NonBlockingResult for Result<T, io::Error> {
    type Value = T;

    fn no_block(self) -> Result<Option<T>, Error> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl<T> NonBlockingResult for Result<T, Error> {
    type Value = T;

    fn no_block(self) -> Result<Option<T>, Error> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}
