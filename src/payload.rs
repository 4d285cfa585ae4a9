//! Explicit value encoding for cache writes.
//!
//! The facade never inspects runtime types. Callers hand it something that
//! implements [`IntoPayload`]:
//!
//! - strings and byte buffers are stored as-is;
//! - integers, floats and bools are stored in their textual form, so that
//!   backend-side `INCRBY` and cross-language readers see plain numbers;
//! - structured data goes through an explicit wrapper, [`Json`] or
//!   [`Postcard`], chosen by the caller.
//!
//! ```
//! use lease_cache::payload::{IntoPayload, Json};
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct User { id: u64, name: String }
//!
//! # fn main() -> lease_cache::Result<()> {
//! let bytes = Json(User { id: 1, name: "alice".into() }).into_payload()?;
//! assert_eq!(bytes, br#"{"id":1,"name":"alice"}"#.to_vec());
//! assert_eq!(42i64.into_payload()?, b"42".to_vec());
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use serde::Serialize;

/// Conversion of a caller value into the bytes written to the backend.
pub trait IntoPayload {
    fn into_payload(self) -> Result<Vec<u8>>;
}

impl IntoPayload for Vec<u8> {
    fn into_payload(self) -> Result<Vec<u8>> {
        Ok(self)
    }
}

impl IntoPayload for &[u8] {
    fn into_payload(self) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }
}

impl<const N: usize> IntoPayload for &[u8; N] {
    fn into_payload(self) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }
}

impl IntoPayload for String {
    fn into_payload(self) -> Result<Vec<u8>> {
        Ok(self.into_bytes())
    }
}

impl IntoPayload for &str {
    fn into_payload(self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }
}

impl IntoPayload for &String {
    fn into_payload(self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }
}

macro_rules! textual_payload {
    ($($ty:ty),*) => {
        $(
            impl IntoPayload for $ty {
                fn into_payload(self) -> Result<Vec<u8>> {
                    Ok(self.to_string().into_bytes())
                }
            }
        )*
    };
}

textual_payload!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, bool);

/// Store `T` as JSON.
#[derive(Clone, Debug)]
pub struct Json<T>(pub T);

impl<T: Serialize> IntoPayload for Json<T> {
    fn into_payload(self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }
}

/// Store `T` as compact Postcard bytes.
///
/// Only readable from Rust; prefer [`Json`] when other services share the
/// keyspace.
#[derive(Clone, Debug)]
pub struct Postcard<T>(pub T);

impl<T: Serialize> IntoPayload for Postcard<T> {
    fn into_payload(self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(&self.0)?)
    }
}
