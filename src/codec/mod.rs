//! Blob codec: values <-> base64 text safe to carry as a request parameter
//! or uploaded payload.
//!
//! A blob is the standard base64 encoding of the value's JSON form. Decoding
//! builds fresh buffers per call and touches no shared state.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::GateError;

pub mod filter;

pub use filter::{decode_filter, encode_filter, rebuild_predicate, FilterSpec, PredicateRegistry};

/// Largest encoded blob accepted unless configured otherwise.
pub const DEFAULT_MAX_BLOB_BYTES: usize = 1024 * 1024;

/// Encodes any serializable value, predicate or not.
pub fn to_blob<T: Serialize + ?Sized>(value: &T) -> Result<String, GateError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|err| GateError::InvalidArgument(format!("value cannot be encoded: {err}")))?;
    Ok(STANDARD.encode(bytes))
}

pub fn from_blob<T: DeserializeOwned>(blob: &str) -> Result<T, GateError> {
    let value = decode_value(blob, DEFAULT_MAX_BLOB_BYTES)?;
    serde_json::from_value(value).map_err(|err| GateError::BlobMalformed(err.to_string()))
}

/// Decodes a blob into its untyped JSON form.
pub fn decode_value(blob: &str, max_bytes: usize) -> Result<Value, GateError> {
    let blob = blob.trim();
    if blob.is_empty() {
        return Err(GateError::BlobMalformed("blob is empty".to_string()));
    }
    if blob.len() > max_bytes {
        return Err(GateError::BlobMalformed(format!(
            "blob is {} bytes, limit is {}",
            blob.len(),
            max_bytes
        )));
    }
    let bytes = STANDARD
        .decode(blob)
        .map_err(|err| GateError::BlobMalformed(format!("invalid base64: {err}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| GateError::BlobMalformed(format!("invalid payload: {err}")))
}

/// Short digest identifying a blob in logs without revealing its content.
pub fn fingerprint(blob: &str) -> String {
    let digest = Sha256::digest(blob.trim().as_bytes());
    hex::encode(&digest[..8])
}
