//! Wire payload codec
//!
//! Converts a key sequence and a value to and from the payload string carried
//! by a notification:
//!
//! ```text
//! "e" [key1[,key2...]] [":" json-value]
//! ```
//!
//! Keys are unsigned decimal integers. The value is JSON with every `$`
//! written as `\u0024`, since the payload is embedded in a dollar-quoted
//! literal of the outbound `notify` statement.
//!
//! Decoding reads untrusted payloads (anything on the channel, including
//! triggers and other producers). Every failure is returned as a
//! [`CodecError`]; nothing in this module panics on input.

use crate::types::Event;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// First character of every event payload.
pub const PREFIX: char = 'e';

const KEY_SEPARATOR: char = ',';
const VALUE_SEPARATOR: char = ':';
const ESCAPED_DOLLAR: &str = "\\u0024";

/// Codec error types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A key could not be represented as an unsigned integer
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// The value could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The payload does not start with the event prefix
    #[error("Payload is not an event")]
    MissingPrefix,

    /// The key segment of the payload is malformed
    #[error("Malformed keys: {0}")]
    MalformedKeys(String),

    /// The value segment of the payload is not valid JSON
    #[error("Malformed value: {0}")]
    MalformedValue(String),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Conversion of producer-supplied keys into event keys.
///
/// Implemented for unsigned integers, non-negative signed integers, integral
/// non-negative floats and decimal strings.
pub trait ToKey {
    /// Convert to an event key.
    fn to_key(&self) -> CodecResult<u64>;
}

macro_rules! unsigned_key {
    ($($t:ty),*) => {
        $(impl ToKey for $t {
            fn to_key(&self) -> CodecResult<u64> {
                Ok(*self as u64)
            }
        })*
    };
}

macro_rules! signed_key {
    ($($t:ty),*) => {
        $(impl ToKey for $t {
            fn to_key(&self) -> CodecResult<u64> {
                u64::try_from(*self).map_err(|_| CodecError::InvalidKey(self.to_string()))
            }
        })*
    };
}

unsigned_key!(u8, u16, u32, u64, usize);
signed_key!(i8, i16, i32, i64, isize, i128, u128);

impl ToKey for f64 {
    fn to_key(&self) -> CodecResult<u64> {
        // 2^64 is exactly representable; anything at or above it overflows.
        if self.is_finite() && self.fract() == 0.0 && *self >= 0.0 && *self < 18_446_744_073_709_551_616.0 {
            Ok(*self as u64)
        } else {
            Err(CodecError::InvalidKey(self.to_string()))
        }
    }
}

impl ToKey for f32 {
    fn to_key(&self) -> CodecResult<u64> {
        f64::from(*self).to_key()
    }
}

impl ToKey for str {
    fn to_key(&self) -> CodecResult<u64> {
        parse_key(self.trim()).ok_or_else(|| CodecError::InvalidKey(self.to_string()))
    }
}

impl ToKey for String {
    fn to_key(&self) -> CodecResult<u64> {
        self.as_str().to_key()
    }
}

impl<T: ToKey + ?Sized> ToKey for &T {
    fn to_key(&self) -> CodecResult<u64> {
        (**self).to_key()
    }
}

/// Encode a key sequence and a value into an event payload.
///
/// Fails if any key is not integer-representable or the value cannot be
/// serialized.
pub fn encode<K, V>(keys: &[K], value: &V) -> CodecResult<String>
where
    K: ToKey,
    V: Serialize + ?Sized,
{
    let keys = encode_keys(keys)?;
    let value = encode_value(value)?;

    let mut payload = String::with_capacity(1 + keys.len() + 1 + value.len());
    payload.push(PREFIX);
    payload.push_str(&keys);
    payload.push(VALUE_SEPARATOR);
    payload.push_str(&value);

    Ok(payload)
}

/// Encode a key sequence as a comma-joined decimal list.
pub fn encode_keys<K: ToKey>(keys: &[K]) -> CodecResult<String> {
    let mut encoding = String::new();

    for (i, key) in keys.iter().enumerate() {
        if i != 0 {
            encoding.push(KEY_SEPARATOR);
        }
        encoding.push_str(&key.to_key()?.to_string());
    }

    Ok(encoding)
}

/// Encode a value as JSON safe for embedding in a dollar-quoted literal.
pub fn encode_value<V: Serialize + ?Sized>(value: &V) -> CodecResult<String> {
    let json = serde_json::to_string(value).map_err(|e| CodecError::Serialization(e.to_string()))?;

    // `$` can only occur inside JSON strings, where a unicode escape is equivalent.
    Ok(json.replace('$', ESCAPED_DOLLAR))
}

/// Decode a payload received on `channel` into an event.
pub fn decode(channel: &str, payload: &str) -> CodecResult<Event> {
    let body = payload.strip_prefix(PREFIX).ok_or(CodecError::MissingPrefix)?;

    if body.is_empty() {
        return Ok(Event::data(channel, Vec::new(), Value::Null));
    }

    match body.split_once(VALUE_SEPARATOR) {
        None => Ok(Event::data(channel, decode_keys(body)?, Value::Null)),
        Some((keys, value)) => {
            let keys = decode_keys(keys)?;
            let value = serde_json::from_str(value).map_err(|e| CodecError::MalformedValue(e.to_string()))?;
            Ok(Event::data(channel, keys, value))
        }
    }
}

fn decode_keys(segment: &str) -> CodecResult<Vec<u64>> {
    if segment.is_empty() {
        return Ok(Vec::new());
    }

    segment
        .split(KEY_SEPARATOR)
        .map(|key| parse_key(key).ok_or_else(|| CodecError::MalformedKeys(segment.to_string())))
        .collect()
}

fn parse_key(text: &str) -> Option<u64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}
