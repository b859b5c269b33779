//! Byte signatures with wildcard positions.
//!
//! A signature is a fixed-length byte template where each position is
//! either an exact value or a wildcard. Two source formats are
//! supported: a byte slice paired with an ASCII mask (`'x'` exact,
//! `'?'` wildcard) and a whitespace-separated hex token string where
//! `??` marks a wildcard.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// A byte pattern with wildcard positions, used to locate known code
/// sequences in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteSignature {
    bytes: Vec<Option<u8>>,
}

impl ByteSignature {
    /// Build a signature from a byte pattern and an equal-length mask
    /// string, `'x'` meaning exact and `'?'` meaning wildcard.
    pub fn from_pattern_mask(pattern: &[u8], mask: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::InvalidSignature("pattern is empty".to_string()));
        }
        if pattern.len() != mask.len() {
            return Err(Error::InvalidSignature(format!(
                "pattern length {} does not match mask length {}",
                pattern.len(),
                mask.len()
            )));
        }

        let mut bytes = Vec::with_capacity(pattern.len());
        for (value, flag) in pattern.iter().zip(mask.chars()) {
            match flag {
                'x' => bytes.push(Some(*value)),
                '?' => bytes.push(None),
                other => {
                    return Err(Error::InvalidSignature(format!(
                        "invalid mask character '{}'",
                        other
                    )));
                }
            }
        }

        Ok(Self { bytes })
    }

    /// Parse a signature from hex token text, e.g. `"F3 0F 59 05 ?? ?? ?? ??"`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut bytes = Vec::new();
        for token in text.split_whitespace() {
            if token == "??" || token == "?" {
                bytes.push(None);
                continue;
            }

            let value = u8::from_str_radix(token, 16).map_err(|e| {
                Error::InvalidSignature(format!("invalid token '{}': {}", token, e))
            })?;
            bytes.push(Some(value));
        }

        if bytes.is_empty() {
            return Err(Error::InvalidSignature("pattern is empty".to_string()));
        }

        Ok(Self { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; empty signatures are rejected at construction.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[Option<u8>] {
        &self.bytes
    }

    /// Position and value of the first non-wildcard byte, if any.
    pub fn first_fixed(&self) -> Option<(usize, u8)> {
        self.bytes
            .iter()
            .enumerate()
            .find_map(|(i, b)| b.map(|value| (i, value)))
    }

    /// Test the predicate against a window of exactly `self.len()` bytes.
    pub fn matches_at(&self, window: &[u8]) -> bool {
        debug_assert_eq!(window.len(), self.bytes.len());
        self.bytes
            .iter()
            .zip(window)
            .all(|(expected, actual)| match expected {
                Some(value) => value == actual,
                None => true,
            })
    }

    /// Format back into hex token text.
    pub fn to_text(&self) -> String {
        self.bytes
            .iter()
            .map(|b| match b {
                Some(value) => format!("{:02X}", value),
                None => "??".to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A named signature in its persisted text form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub name: String,
    pub pattern: String,
}

impl SignatureEntry {
    pub fn signature(&self) -> Result<ByteSignature> {
        ByteSignature::parse(&self.pattern)
    }
}

/// A versioned collection of named signatures, persisted as JSON so
/// signature updates do not require rebuilding the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureSet {
    pub version: String,
    pub entries: Vec<SignatureEntry>,
}

impl SignatureSet {
    pub fn entry(&self, name: &str) -> Option<&SignatureEntry> {
        self.entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
    }

    /// Look up an entry that callers cannot proceed without.
    pub fn require(&self, name: &str) -> Result<&SignatureEntry> {
        self.entry(name)
            .ok_or_else(|| Error::SignatureNotFound(name.to_string()))
    }
}

pub fn load_signatures<P: AsRef<Path>>(path: P) -> Result<SignatureSet> {
    let content = fs::read_to_string(&path)?;
    let data = serde_json::from_str(&content)?;
    Ok(data)
}

pub fn save_signatures<P: AsRef<Path>>(path: P, signatures: &SignatureSet) -> Result<()> {
    let content = serde_json::to_string_pretty(signatures)?;
    fs::write(path, content)?;
    Ok(())
}
