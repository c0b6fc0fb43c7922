//! Utility functions for ringkv

use crate::common::message::MAX_FRAME_SIZE;
use std::time::{SystemTime, UNIX_EPOCH};

/// Longest accepted key or column family name
pub const MAX_KEY_LEN: usize = 1024;

/// Longest value that still fits in one frame next to a maximal key,
/// column family and message header
pub const MAX_VALUE_LEN: usize = MAX_FRAME_SIZE - 4 * MAX_KEY_LEN;

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Get current Unix timestamp (nanoseconds)
pub fn timestamp_now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Validate a key: present (non-empty) and of reasonable length.
pub fn validate_key(key: &[u8]) -> crate::Result<()> {
    if key.is_empty() {
        return Err(crate::Error::InvalidArgument("key cannot be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(crate::Error::InvalidArgument(format!(
            "key too long (max {} bytes)",
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

/// Validate a column family name: present (non-empty) and of reasonable length.
pub fn validate_column_family(col_fam: &[u8]) -> crate::Result<()> {
    if col_fam.is_empty() {
        return Err(crate::Error::InvalidArgument(
            "column family cannot be empty".into(),
        ));
    }
    if col_fam.len() > MAX_KEY_LEN {
        return Err(crate::Error::InvalidArgument(format!(
            "column family name too long (max {} bytes)",
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

/// Validate a value: present (non-empty) and small enough to frame.
pub fn validate_value(value: &[u8]) -> crate::Result<()> {
    if value.is_empty() {
        return Err(crate::Error::InvalidArgument("value cannot be empty".into()));
    }
    if value.len() > MAX_VALUE_LEN {
        return Err(crate::Error::InvalidArgument(format!(
            "value too large ({} bytes, max {})",
            value.len(),
            MAX_VALUE_LEN
        )));
    }
    Ok(())
}

/// Render bytes for logs: UTF-8 when printable, hex otherwise.
pub fn display_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) if s.chars().all(|c| !c.is_control()) => s.to_string(),
        _ => format!("0x{}", hex::encode(bytes)),
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}
