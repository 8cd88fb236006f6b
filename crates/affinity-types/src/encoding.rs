//! Encoding utilities for compiled units.
//!
//! Raw units travel between the loader and the rewrite engine as BCS bytes.
//! JSON is accepted wherever a human writes or reads units (fixtures, CLI).

use crate::unit::CompiledUnit;
use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

// =============================================================================
// Unit Formats
// =============================================================================

/// Serialized form of a compiled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitFormat {
    Bcs,
    Json,
}

impl UnitFormat {
    /// Pick a format from a file extension (`.json` → JSON, anything else → BCS).
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => UnitFormat::Json,
            _ => UnitFormat::Bcs,
        }
    }

    /// Sniff the format from the leading bytes.
    pub fn detect(bytes: &[u8]) -> Self {
        match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') => UnitFormat::Json,
            _ => UnitFormat::Bcs,
        }
    }
}

/// Failure to decode a raw unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub format: UnitFormat,
    pub message: String,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let format = match self.format {
            UnitFormat::Bcs => "BCS",
            UnitFormat::Json => "JSON",
        };
        write!(f, "failed to decode {} unit: {}", format, self.message)
    }
}

impl std::error::Error for DecodeError {}

/// Encode a unit in the canonical raw (BCS) form.
pub fn encode_unit(unit: &CompiledUnit) -> Result<Vec<u8>> {
    bcs::to_bytes(unit).map_err(|e| anyhow!("Failed to BCS-encode unit {}: {}", unit.name, e))
}

/// Encode a unit in the requested format.
pub fn encode_unit_as(unit: &CompiledUnit, format: UnitFormat) -> Result<Vec<u8>> {
    match format {
        UnitFormat::Bcs => encode_unit(unit),
        UnitFormat::Json => serde_json::to_vec_pretty(unit)
            .map_err(|e| anyhow!("Failed to JSON-encode unit {}: {}", unit.name, e)),
    }
}

/// Decode a raw (BCS) unit.
pub fn decode_unit(bytes: &[u8]) -> Result<CompiledUnit, DecodeError> {
    decode_unit_as(bytes, UnitFormat::Bcs)
}

/// Decode a unit in the given format.
pub fn decode_unit_as(bytes: &[u8], format: UnitFormat) -> Result<CompiledUnit, DecodeError> {
    let result = match format {
        UnitFormat::Bcs => bcs::from_bytes(bytes).map_err(|e| e.to_string()),
        UnitFormat::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
    };
    result.map_err(|message| DecodeError { format, message })
}

/// Decode a unit, sniffing JSON vs BCS.
pub fn decode_unit_auto(bytes: &[u8]) -> Result<CompiledUnit, DecodeError> {
    decode_unit_as(bytes, UnitFormat::detect(bytes))
}

/// Read and decode a unit file (format chosen by extension).
pub fn read_unit_file(path: &Path) -> Result<CompiledUnit> {
    let bytes = std::fs::read(path)
        .map_err(|e| anyhow!("Failed to read unit file {}: {}", path.display(), e))?;
    decode_unit_as(&bytes, UnitFormat::from_path(path))
        .map_err(|e| anyhow!("{}: {}", path.display(), e))
}

// =============================================================================
// Version Digests
// =============================================================================

/// Version digest of a unit: SHA-256 over its canonical BCS encoding.
pub fn unit_digest(unit: &CompiledUnit) -> Result<String> {
    Ok(bytes_digest(&encode_unit(unit)?))
}

/// Hex SHA-256 of raw bytes.
pub fn bytes_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

// =============================================================================
// Base64 Encoding/Decoding
// =============================================================================

/// Encode bytes to base64 string.
pub fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode base64 string to bytes with context-aware error message.
pub fn base64_decode(b64: &str, context: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|e| anyhow!("Failed to decode {} from base64: {}", context, e))
}
