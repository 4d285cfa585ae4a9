//! Three-state read outcome.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use std::str::FromStr;

#[derive(Debug, Clone)]
enum State {
    Present(Vec<u8>),
    Absent,
    Failed(Error),
}

/// Outcome of a cache read: a value, a miss, or an error.
///
/// A deliberately cached "no value" sentinel and a plain miss both read as
/// absent. Every typed accessor checks the error first, then absence, then
/// decodes.
///
/// ```
/// use lease_cache::CacheResult;
///
/// let hit = CacheResult::present(b"42".to_vec());
/// assert_eq!(hit.i64().unwrap(), Some(42));
///
/// let miss = CacheResult::absent();
/// assert!(miss.is_absent());
/// assert_eq!(miss.string().unwrap(), None);
/// ```
#[derive(Debug, Clone)]
pub struct CacheResult {
    state: State,
    write_error: Option<Error>,
}

impl CacheResult {
    pub fn present(value: Vec<u8>) -> Self {
        CacheResult {
            state: State::Present(value),
            write_error: None,
        }
    }

    pub fn absent() -> Self {
        CacheResult {
            state: State::Absent,
            write_error: None,
        }
    }

    pub fn failed(error: Error) -> Self {
        CacheResult {
            state: State::Failed(error),
            write_error: None,
        }
    }

    /// Attach the error of a write-back that followed a successful read-through.
    pub(crate) fn with_write_error(mut self, error: Option<Error>) -> Self {
        self.write_error = error;
        self
    }

    pub fn is_present(&self) -> bool {
        matches!(self.state, State::Present(_))
    }

    pub fn is_absent(&self) -> bool {
        matches!(self.state, State::Absent)
    }

    pub fn is_err(&self) -> bool {
        matches!(self.state, State::Failed(_))
    }

    /// The read error, if any.
    pub fn err(&self) -> Option<&Error> {
        match &self.state {
            State::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Error from storing a freshly produced value (or sentinel).
    ///
    /// Only `get_set` sets this. The value is still valid; it just was not
    /// cached.
    pub fn write_error(&self) -> Option<&Error> {
        self.write_error.as_ref()
    }

    /// Raw bytes, `None` when absent.
    pub fn bytes(&self) -> Result<Option<&[u8]>> {
        match &self.state {
            State::Present(v) => Ok(Some(v.as_slice())),
            State::Absent => Ok(None),
            State::Failed(e) => Err(e.clone()),
        }
    }

    /// Consume into the underlying outcome.
    pub fn into_result(self) -> Result<Option<Vec<u8>>> {
        match self.state {
            State::Present(v) => Ok(Some(v)),
            State::Absent => Ok(None),
            State::Failed(e) => Err(e),
        }
    }

    /// Value as UTF-8 text.
    pub fn string(&self) -> Result<Option<String>> {
        match self.bytes()? {
            Some(b) => String::from_utf8(b.to_vec())
                .map(Some)
                .map_err(|e| Error::DeserializationError(format!("value is not UTF-8: {}", e))),
            None => Ok(None),
        }
    }

    /// Text value or empty string when absent, mirroring a plain `GET`.
    pub fn val(&self) -> Result<String> {
        Ok(self.string()?.unwrap_or_default())
    }

    pub fn i64(&self) -> Result<Option<i64>> {
        self.parse()
    }

    pub fn u64(&self) -> Result<Option<u64>> {
        self.parse()
    }

    pub fn f64(&self) -> Result<Option<f64>> {
        self.parse()
    }

    pub fn bool(&self) -> Result<Option<bool>> {
        self.parse()
    }

    /// Parse the textual value with `FromStr`.
    pub fn parse<T>(&self) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string()? {
            Some(s) => s.trim().parse::<T>().map(Some).map_err(|e| {
                Error::DeserializationError(format!(
                    "cannot parse {:?} as {}: {}",
                    s,
                    std::any::type_name::<T>(),
                    e
                ))
            }),
            None => Ok(None),
        }
    }

    /// Decode a JSON value.
    pub fn json<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.bytes()? {
            Some(b) => Ok(Some(serde_json::from_slice(b)?)),
            None => Ok(None),
        }
    }

    /// Decode a value written through [`crate::payload::Postcard`].
    pub fn postcard<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.bytes()? {
            Some(b) => Ok(Some(postcard::from_bytes(b)?)),
            None => Ok(None),
        }
    }
}

impl From<Result<Option<Vec<u8>>>> for CacheResult {
    fn from(r: Result<Option<Vec<u8>>>) -> Self {
        match r {
            Ok(Some(v)) => CacheResult::present(v),
            Ok(None) => CacheResult::absent(),
            Err(e) => CacheResult::failed(e),
        }
    }
}
