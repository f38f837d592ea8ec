//! Codecs — conversion between in-memory values and stored byte strings.
//!
//! The store only holds byte strings; every typed record goes through one
//! of three encodings: UTF-8 text, decimal integers, or compact JSON.
//! Decode failures are [`BadValue`](crate::VisorError::BadValue) and are
//! never recovered — they mean the tree holds something the schema does
//! not allow.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{VisorError, VisorResult};

/// Two-way conversion between a value and its stored byte string.
pub trait Codec {
    type Value;

    fn encode(&self, value: &Self::Value) -> VisorResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> VisorResult<Self::Value>;
}

/// UTF-8 text, stored as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec for StringCodec {
    type Value = String;

    fn encode(&self, value: &String) -> VisorResult<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> VisorResult<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| VisorError::BadValue(format!("invalid utf-8: {e}")))
    }
}

/// Decimal integer, stored as its ASCII representation.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntCodec;

impl Codec for IntCodec {
    type Value = i64;

    fn encode(&self, value: &i64) -> VisorResult<Vec<u8>> {
        Ok(value.to_string().into_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> VisorResult<i64> {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| {
                VisorError::BadValue(format!(
                    "not a decimal integer: {:?}",
                    String::from_utf8_lossy(bytes)
                ))
            })
    }
}

/// Compact JSON object, typed via serde.
#[derive(Debug)]
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Codec for JsonCodec<T> {
    type Value = T;

    fn encode(&self, value: &T) -> VisorResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| VisorError::BadValue(format!("encode json: {e}")))
    }

    fn decode(&self, bytes: &[u8]) -> VisorResult<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| VisorError::BadValue(format!("decode json: {e}")))
    }
}
