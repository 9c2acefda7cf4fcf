// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Cluster-native quantity parsing.
//!
//! CPU quantities normalise to cores (`"250m"` → 0.25, `"1"` → 1.0); memory
//! quantities normalise to bytes (`"64Mi"` → 67108864). A plain number
//! carries no unit — the caller decides cores vs. bytes. Memory suffixes are
//! matched **before** the bare `m` millicore suffix so `"128Mi"` is never
//! read as millicores.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
#[error("invalid quantity {0:?}")]
pub struct QuantityError(pub String);

// Multi-character binary suffixes first, then single-character decimal ones.
// Bare "m" is deliberately absent: it is the CPU millicore suffix.
const MEMORY_SUFFIXES: [(&str, f64); 7] = [
    ("ki", 1024.0),
    ("mi", 1024.0 * 1024.0),
    ("gi", 1024.0 * 1024.0 * 1024.0),
    ("ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("k", 1e3),
    ("g", 1e9),
    ("t", 1e12),
];

/// Parse a quantity string into a normalised float.
///
/// Empty input parses to `0.0` (all quota fields treat empty as "unset").
pub fn parse_quantity(q: &str) -> Result<f64, QuantityError> {
    let q = q.trim();
    if q.is_empty() {
        return Ok(0.0);
    }
    let lower = q.to_ascii_lowercase();

    for (suffix, factor) in MEMORY_SUFFIXES {
        if let Some(number) = lower.strip_suffix(suffix) {
            let value: f64 = number
                .trim()
                .parse()
                .map_err(|_| QuantityError(q.to_string()))?;
            return Ok(value * factor);
        }
    }

    // CPU millicores: bare "m" suffix, e.g. "500m" → 0.5 cores.
    if let Some(number) = lower.strip_suffix('m') {
        let value: f64 = number
            .trim()
            .parse()
            .map_err(|_| QuantityError(q.to_string()))?;
        return Ok(value / 1000.0);
    }

    lower.parse().map_err(|_| QuantityError(q.to_string()))
}

// ── Unit tests ────────────────────────────────────────────────────────────────
