//! Secret wrapper for sensitive values (client secrets, bearer tokens)

use std::fmt;

use serde::{Deserialize, Deserializer};
use zeroize::Zeroize;

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Credential lists arrive as JSON; secrets are wrapped at the parse boundary
/// so they never exist as a bare `String` field.
impl<'de, T: Zeroize + Deserialize<'de>> Deserialize<'de> for Secret<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Secret::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_redacts_debug() {
        let secret = Secret::new(String::from("client-secret-abc"));
        let debug = format!("{:?}", secret);
        assert_eq!(debug, "[REDACTED]");
        assert!(!debug.contains("client-secret-abc"));
    }

    #[test]
    fn test_secret_exposes_value() {
        let secret = Secret::new(String::from("client-secret-abc"));
        assert_eq!(secret.expose(), "client-secret-abc");
    }

    #[test]
    fn test_secret_deserializes_from_plain_string() {
        #[derive(Deserialize)]
        struct Pair {
            client_id: String,
            client_secret: Secret<String>,
        }

        let pair: Pair =
            serde_json::from_str(r#"{"client_id":"id-1","client_secret":"s3cr3t"}"#).unwrap();
        assert_eq!(pair.client_id, "id-1");
        assert_eq!(pair.client_secret.expose(), "s3cr3t");
        assert_eq!(format!("{}", pair.client_secret), "[REDACTED]");
    }
}
