use crate::sandbox::error::SandboxError;
use serde::{Deserialize, Serialize};

/// Memory limit given either as raw bytes or as a string like `512m`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum MemoryLimit {
    Bytes(i64),
    Text(String),
}

impl MemoryLimit {
    /// Convert to bytes. `-1` is passed through (unlimited swap).
    pub fn to_bytes(&self) -> Result<i64, SandboxError> {
        match self {
            MemoryLimit::Bytes(bytes) if *bytes >= -1 => Ok(*bytes),
            MemoryLimit::Bytes(bytes) => Err(SandboxError::InvalidMemory(bytes.to_string())),
            MemoryLimit::Text(text) => parse_memory(text),
        }
    }
}

fn parse_memory(raw: &str) -> Result<i64, SandboxError> {
    let value = raw.trim().to_lowercase();
    if value == "-1" {
        return Ok(-1);
    }

    let digits_end = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(digits_end);
    let number: f64 = number
        .parse()
        .map_err(|_| SandboxError::InvalidMemory(raw.to_string()))?;

    let multiplier: f64 = match unit.trim_end_matches('b') {
        "" => 1.0,
        "k" => 1024.0,
        "m" => 1024.0 * 1024.0,
        "g" => 1024.0 * 1024.0 * 1024.0,
        "t" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return Err(SandboxError::InvalidMemory(raw.to_string())),
    };

    Ok((number * multiplier).round() as i64)
}

/// A ulimit: a single value for soft and hard, a `{soft, hard}` pair, or a
/// `"soft:hard"` string
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum UlimitValue {
    Limit(i64),
    Range {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        soft: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hard: Option<i64>,
    },
    Text(String),
}

impl UlimitValue {
    /// Resolve to `(soft, hard)`; a missing side takes the other side's value.
    pub fn to_soft_hard(&self, name: &str) -> Result<(i64, i64), SandboxError> {
        let invalid = || SandboxError::InvalidUlimit {
            name: name.to_string(),
            value: format!("{:?}", self),
        };

        match self {
            UlimitValue::Limit(value) => Ok((*value, *value)),
            UlimitValue::Range { soft, hard } => match (soft, hard) {
                (Some(soft), Some(hard)) => Ok((*soft, *hard)),
                (Some(value), None) | (None, Some(value)) => Ok((*value, *value)),
                (None, None) => Err(invalid()),
            },
            UlimitValue::Text(text) => {
                let mut parts = text.trim().splitn(2, ':');
                let soft: i64 = parts
                    .next()
                    .and_then(|p| p.trim().parse().ok())
                    .ok_or_else(invalid)?;
                let hard = match parts.next() {
                    Some(p) => p.trim().parse().map_err(|_| invalid())?,
                    None => soft,
                };
                Ok((soft, hard))
            }
        }
    }
}
