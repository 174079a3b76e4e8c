//! Session codes
//!
//! Short identifiers a person can read off one screen and type into
//! another. They address relay mailboxes and gate direct links against
//! accidental cross-talk; they are not credentials.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Code length in characters
pub const CODE_LEN: usize = 6;

/// Uppercase alphanumerics minus look-alikes (0/O, 1/I)
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionCode(String);

impl SessionCode {
    /// Generate a fresh random code
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let code = (0..CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// Parse user input. Case and surrounding whitespace are ignored.
    pub fn parse(input: &str) -> Result<Self, CodeError> {
        let normalized = input.trim().to_ascii_uppercase();
        if normalized.len() != CODE_LEN {
            return Err(CodeError::Length(normalized.len()));
        }
        if let Some(bad) = normalized
            .chars()
            .find(|c| !c.is_ascii() || !CODE_ALPHABET.contains(&(*c as u8)))
        {
            return Err(CodeError::InvalidChar(bad));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for SessionCode {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionCode {
    type Error = CodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionCode> for String {
    fn from(code: SessionCode) -> Self {
        code.0
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodeError {
    #[error("Session code must be {CODE_LEN} characters, got {0}")]
    Length(usize),

    #[error("Invalid character in session code: {0:?}")]
    InvalidChar(char),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_codes_use_alphabet() {
        for _ in 0..200 {
            let code = SessionCode::generate();
            assert_eq!(code.as_str().len(), CODE_LEN);
            assert!(code.as_str().bytes().all(|b| CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_parse_normalizes_case() {
        let code = SessionCode::parse("  ab3dkz ").unwrap();
        assert_eq!(code.as_str(), "AB3DKZ");
    }

    #[test]
    fn test_parse_rejects_lookalikes_and_length() {
        assert_eq!(SessionCode::parse("ABC0EF"), Err(CodeError::InvalidChar('0')));
        assert_eq!(SessionCode::parse("ABCIEF"), Err(CodeError::InvalidChar('I')));
        assert_eq!(SessionCode::parse("ABC"), Err(CodeError::Length(3)));
    }

    #[test]
    fn test_serde_roundtrip_validates() {
        let json = serde_json::to_string(&SessionCode::parse("XYZ234").unwrap()).unwrap();
        assert_eq!(json, "\"XYZ234\"");
        assert!(serde_json::from_str::<SessionCode>("\"bad\"").is_err());
    }
}
