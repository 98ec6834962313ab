//! Content fingerprints used to detect local/authority content conflicts.
//!
//! Uses SHA-256 over the raw content bytes.

use crate::value::Attributes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte SHA-256 content fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentChecksum([u8; 32]);

impl ContentChecksum {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ContentChecksum(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Fingerprint raw content.
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        ContentChecksum(bytes)
    }

    /// Fingerprint an attribute map through its canonical JSON encoding.
    /// `Attributes` is ordered, so equal maps always hash equal.
    pub fn of_attributes(attributes: &Attributes) -> Result<Self, serde_json::Error> {
        let encoded = serde_json::to_vec(attributes)?;
        Ok(Self::of(&encoded))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(hex_str, 16).ok()?;
        }
        Some(ContentChecksum(bytes))
    }

    /// Truncated display (first 8 chars).
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Debug for ContentChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentChecksum({}...)", self.short())
    }
}

impl fmt::Display for ContentChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
