//! API client credentials
//!
//! Credentials arrive as a JSON array of `{"client_id", "client_secret"}`
//! pairs, from the `CREDENTIALS` environment variable or a credentials file.
//! Secrets stay wrapped in `Secret` so they never reach logs.

use std::collections::HashSet;
use std::path::Path;

use common::Secret;
use resource_pool::Resource;
use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};

/// Environment variable holding the credential list as JSON.
pub const CREDENTIALS_ENV: &str = "CREDENTIALS";

/// One client-credentials pair.
#[derive(Debug, Clone, Deserialize)]
pub struct Credential {
    pub client_id: String,
    pub client_secret: Secret<String>,
}

impl Credential {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: Secret::new(client_secret.into()),
        }
    }
}

impl Resource for Credential {
    fn id(&self) -> &str {
        &self.client_id
    }
}

/// Parse and validate a JSON credential list.
///
/// Rejects empty client ids and duplicates; order is preserved because it is
/// the rotation order.
pub fn parse_credentials(json: &str) -> Result<Vec<Credential>> {
    let credentials: Vec<Credential> =
        serde_json::from_str(json).map_err(common::Error::from)?;

    let mut seen = HashSet::new();
    for credential in &credentials {
        if credential.client_id.trim().is_empty() {
            return Err(Error::Config("credential with empty client_id".into()));
        }
        if !seen.insert(credential.client_id.as_str()) {
            return Err(Error::Config(format!(
                "duplicate client_id in credential list: {}",
                credential.client_id
            )));
        }
    }
    Ok(credentials)
}

/// Load credentials: `CREDENTIALS` env var first, then `file` if given.
pub fn load_credentials(file: Option<&Path>) -> Result<Vec<Credential>> {
    if let Ok(json) = std::env::var(CREDENTIALS_ENV) {
        let credentials = parse_credentials(&json)?;
        info!(count = credentials.len(), source = "env", "loaded credentials");
        return Ok(credentials);
    }

    let Some(path) = file else {
        return Err(Error::Config(format!(
            "no credentials: set {CREDENTIALS_ENV} or credentials_file"
        )));
    };
    let json = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "failed to read credentials_file {}: {e}",
            path.display()
        ))
    })?;
    let credentials = parse_credentials(&json)?;
    info!(count = credentials.len(), path = %path.display(), "loaded credentials");
    Ok(credentials)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_credential_list_in_order() {
        let creds = parse_credentials(
            r#"[{"client_id":"b","client_secret":"sb"},{"client_id":"a","client_secret":"sa"}]"#,
        )
        .unwrap();
        assert_eq!(creds.len(), 2);
        assert_eq!(creds[0].id(), "b");
        assert_eq!(creds[1].client_secret.expose(), "sa");
    }

    #[test]
    fn debug_output_redacts_secret() {
        let cred = Credential::new("client-1", "very-secret");
        let debug = format!("{cred:?}");
        assert!(debug.contains("client-1"));
        assert!(!debug.contains("very-secret"));
    }

    #[test]
    fn rejects_duplicates() {
        let err = parse_credentials(
            r#"[{"client_id":"a","client_secret":"1"},{"client_id":"a","client_secret":"2"}]"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate client_id"), "got: {err}");
    }

    #[test]
    fn rejects_empty_client_id() {
        assert!(parse_credentials(r#"[{"client_id":" ","client_secret":"x"}]"#).is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_credentials("not json").unwrap_err();
        assert!(err.to_string().contains("JSON parse error"), "got: {err}");
        assert!(parse_credentials(r#"[{"client_id":"a"}]"#).is_err());
    }
}
