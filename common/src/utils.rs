use anyhow::Result;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Interpret a byte payload as UTF-8.
pub fn string_from_bytes(bytes: Bytes) -> Result<String> {
    Ok(String::from_utf8(bytes.to_vec())?)
}

/// Encode a value as a JSON payload.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Decode a JSON payload produced by [`to_payload`].
pub fn from_payload<T: DeserializeOwned>(bytes: &Bytes) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}
