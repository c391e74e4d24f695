use std::fmt;

use {rand::Rng, serde::Serialize, thiserror::Error};

/// Length of generated identifiers.
pub const GENERATED_LEN: usize = 10;

const MIN_LEN: usize = 5;
const MAX_LEN: usize = 20;

/// A session identifier: a phone-number-like run of ASCII digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("session id must be {MIN_LEN}-{MAX_LEN} digits, got {0:?}")]
pub struct InvalidSessionId(pub String);

impl SessionId {
    /// Validate a caller-supplied identifier.
    pub fn parse(raw: &str) -> Result<Self, InvalidSessionId> {
        let raw = raw.trim();
        let valid = (MIN_LEN..=MAX_LEN).contains(&raw.len())
            && raw.bytes().all(|b| b.is_ascii_digit());
        if !valid {
            return Err(InvalidSessionId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// A random 10-digit identifier with a non-zero first digit.
    ///
    /// Uniqueness is the caller's concern; see the registry's collision check.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut id = String::with_capacity(GENERATED_LEN);
        id.push(char::from(b'0' + rng.random_range(1..10u8)));
        for _ in 1..GENERATED_LEN {
            id.push(char::from(b'0' + rng.random_range(0..10u8)));
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
