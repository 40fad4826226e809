//! Cache entry representation, payload encoding, and eviction priority.
//!
//! Payloads are stored as encoded bytes: serialized JSON, gzip-compressed
//! when at or above the configured threshold, and AES-encrypted when the
//! value is detected as sensitive. Compression runs before encryption since
//! ciphertext does not compress.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;

use crate::cache::crypto::{CacheCipher, EncryptedData};
use crate::context::Criticality;
use crate::error::{ResilienceError, ResilienceResult};

/// Field-name fragments that mark a payload as sensitive.
///
/// Matched case-insensitively as substrings of object keys at any nesting
/// depth.
pub const SENSITIVE_FIELD_PATTERNS: &[&str] = &[
    "patientid",
    "patient_id",
    "dob",
    "dateofbirth",
    "date_of_birth",
    "mrn",
    "medicalrecord",
    "medical_record",
    "diagnosis",
    "medication",
    "allergy",
    "ssn",
    "social_security",
];

/// Whether a JSON value contains any sensitive field names, nested included.
pub(crate) fn is_sensitive(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.iter().any(|(key, nested)| {
            let key = key.to_lowercase();
            SENSITIVE_FIELD_PATTERNS.iter().any(|pattern| key.contains(pattern))
                || is_sensitive(nested)
        }),
        Value::Array(items) => items.iter().any(is_sensitive),
        _ => false,
    }
}

/// Encoded payload body: plaintext bytes or an encrypted container.
#[derive(Debug, Clone)]
pub(crate) enum Body {
    Plain(Vec<u8>),
    Encrypted(EncryptedData),
}

/// A payload as stored in the cache map.
#[derive(Debug, Clone)]
pub(crate) struct EncodedValue {
    pub body: Body,
    pub compressed: bool,
}

impl EncodedValue {
    /// Encoded size in bytes, used for byte-budget accounting.
    pub(crate) fn size_bytes(&self) -> usize {
        match &self.body {
            Body::Plain(bytes) => bytes.len(),
            Body::Encrypted(data) => data.nonce.len() + data.ciphertext.len(),
        }
    }
}

/// Serialize, optionally compress, and optionally encrypt a value.
pub(crate) fn encode(
    value: &Value,
    sensitive: bool,
    compression_threshold: usize,
    cipher: &CacheCipher,
) -> ResilienceResult<EncodedValue> {
    let serialized = serde_json::to_vec(value)
        .map_err(|e| ResilienceError::cache(format!("serialization failed: {e}")))?;

    let (bytes, compressed) = if serialized.len() >= compression_threshold {
        (compress(&serialized)?, true)
    } else {
        (serialized, false)
    };

    let body = if sensitive { Body::Encrypted(cipher.encrypt(&bytes)?) } else { Body::Plain(bytes) };

    Ok(EncodedValue { body, compressed })
}

/// Reverse of [`encode`].
pub(crate) fn decode(encoded: &EncodedValue, cipher: &CacheCipher) -> ResilienceResult<Value> {
    let bytes = match &encoded.body {
        Body::Plain(bytes) => bytes.clone(),
        Body::Encrypted(data) => cipher.decrypt(data)?,
    };

    let bytes = if encoded.compressed { decompress(&bytes)? } else { bytes };

    serde_json::from_slice(&bytes)
        .map_err(|e| ResilienceError::cache(format!("deserialization failed: {e}")))
}

fn compress(data: &[u8]) -> ResilienceResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| ResilienceError::cache(format!("compression failed: {e}")))
}

fn decompress(data: &[u8]) -> ResilienceResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .map_err(|e| ResilienceError::cache(format!("decompression failed: {e}")))?;
    Ok(output)
}

/// A single cached entry with its eviction bookkeeping.
#[derive(Debug)]
pub(crate) struct CacheEntry {
    pub value: EncodedValue,
    pub criticality: Criticality,
    pub sensitive: bool,
    pub size_bytes: usize,
    pub inserted_at: Instant,
    pub expires_at: Instant,
    pub access_count: AtomicU32,
    /// Generation stamp matching this entry's slot in the eviction heap;
    /// stale heap slots are discarded against it.
    pub stamp: u64,
}

impl CacheEntry {
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub(crate) fn record_access(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Eviction priority; lower values are evicted first.
    ///
    /// `25 * criticality_weight + min(2 * access_count, 50)
    ///  + max(25 - age_hours, 0) - (10 if sensitive)`
    pub(crate) fn priority(&self, now: Instant) -> i64 {
        let weight = i64::from(self.criticality.weight());
        let accesses = i64::from(self.access_count.load(Ordering::Relaxed)).saturating_mul(2).min(50);
        let age_hours = (now.duration_since(self.inserted_at).as_secs() / 3600) as i64;
        let freshness = (25 - age_hours).max(0);
        let sensitive_discount = if self.sensitive { 10 } else { 0 };

        25 * weight + accesses + freshness - sensitive_discount
    }
}
