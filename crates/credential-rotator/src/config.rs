//! Dispatcher configuration
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Credentials never live in the TOML: they come from the `CREDENTIALS`
//! env var or `credentials_file` (see `credentials::load_credentials`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::throttle::RetryAfterPolicy;

/// Overrides `dispatch.status_file`.
pub const STATUS_FILE_ENV: &str = "STATUS_FILE";

/// Bearer token of a signed-in user, checked alongside the client credentials.
pub const USER_TOKEN_ENV: &str = "SPOTIFY_TOKEN";

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    pub dispatch: DispatchSettings,
    pub scopes: ScopeMap,
    /// Values substituted into scope templates by the capability probe
    #[serde(default)]
    pub probe_params: BTreeMap<String, String>,
}

/// Dispatch behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSettings {
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
    pub token_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_retry_after")]
    pub default_retry_after_secs: u64,
    #[serde(default = "default_max_retry_after")]
    pub max_retry_after_secs: u64,
    /// Cap on the in-process sleep after a 429, independent of the persisted cooldown
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_probe_on_exchange")]
    pub probe_on_exchange: bool,
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
    /// Status-table id under which the user token's labels are stored
    #[serde(default = "default_user_token_row")]
    pub user_token_row: String,
}

fn default_status_file() -> PathBuf {
    PathBuf::from("api_status.json")
}

fn default_max_retries() -> u32 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_retry_after() -> u64 {
    1
}

fn default_max_retry_after() -> u64 {
    3600
}

fn default_max_backoff() -> u64 {
    60
}

fn default_probe_on_exchange() -> bool {
    true
}

fn default_user_token_row() -> String {
    "SPOTIFY".into()
}

/// Scope name -> URL template, e.g. `"Get Track" = "https://api.example.com/v1/tracks/{track_id}"`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ScopeMap(BTreeMap<String, String>);

impl ScopeMap {
    pub fn new(scopes: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(scopes.into_iter().collect())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn template(&self, scope: &str) -> Option<&str> {
        self.0.get(scope).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fill a scope's template from `params`.
    pub fn render(&self, scope: &str, params: &BTreeMap<String, String>) -> Result<String> {
        let template = self
            .template(scope)
            .ok_or_else(|| Error::UnknownScope(scope.to_string()))?;
        Ok(render_template(template, params))
    }
}

/// Replace each `{name}` with `params[name]`; unknown placeholders are left as-is.
pub fn render_template(template: &str, params: &BTreeMap<String, String>) -> String {
    let mut url = template.to_string();
    for (key, value) in params {
        url = url.replace(&format!("{{{key}}}"), value);
    }
    url
}

/// Placeholder names in a template.
fn placeholders(template: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else { break };
        names.push(&after[..close]);
        rest = &after[close + 1..];
    }
    names
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

impl DispatchConfig {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(common::Error::from)?;
        let mut config = Self::parse(&contents)?;
        if let Ok(status_file) = std::env::var(STATUS_FILE_ENV) {
            config.dispatch.status_file = PathBuf::from(status_file);
        }
        Ok(config)
    }

    /// Parse and validate TOML without touching the environment.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: DispatchConfig = toml::from_str(contents).map_err(common::Error::from)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let d = &self.dispatch;
        if !is_http_url(&d.token_url) {
            return Err(Error::Config(format!(
                "token_url must start with http:// or https://, got: {}",
                d.token_url
            )));
        }
        if d.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".into()));
        }
        if d.request_timeout_secs == 0 {
            return Err(Error::Config(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }
        if d.max_retry_after_secs == 0 {
            return Err(Error::Config(
                "max_retry_after_secs must be greater than 0".into(),
            ));
        }
        if self.scopes.is_empty() {
            return Err(Error::Config("at least one scope must be configured".into()));
        }
        for (scope, template) in self.scopes.iter() {
            if !is_http_url(template) {
                return Err(Error::Config(format!(
                    "scope {scope}: URL template must start with http:// or https://"
                )));
            }
            if d.probe_on_exchange {
                if let Some(missing) = placeholders(template)
                    .into_iter()
                    .find(|name| !self.probe_params.contains_key(*name))
                {
                    return Err(Error::Config(format!(
                        "scope {scope}: no probe_params value for {{{missing}}}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.request_timeout_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.dispatch.max_backoff_secs)
    }

    pub fn retry_policy(&self) -> RetryAfterPolicy {
        RetryAfterPolicy {
            default: Duration::from_secs(self.dispatch.default_retry_after_secs),
            max: Duration::from_secs(self.dispatch.max_retry_after_secs),
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("dispatch.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CREDENTIALS_ENV, load_credentials};
    use std::sync::Mutex;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn valid_toml() -> &'static str {
        r#"
[dispatch]
token_url = "https://accounts.example.com/api/token"

[scopes]
"Get Track" = "https://api.example.com/v1/tracks/{track_id}"
"Get Album" = "https://api.example.com/v1/albums/{album_id}"

[probe_params]
track_id = "t1"
album_id = "a1"
"#
    }

    #[test]
    fn test_parse_valid_config_with_defaults() {
        let config = DispatchConfig::parse(valid_toml()).unwrap();
        assert_eq!(config.dispatch.status_file, PathBuf::from("api_status.json"));
        assert_eq!(config.dispatch.max_retries, 5);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_backoff(), Duration::from_secs(60));
        assert!(config.dispatch.probe_on_exchange);
        assert!(config.dispatch.credentials_file.is_none());
        assert_eq!(config.dispatch.user_token_row, "SPOTIFY");
        assert_eq!(config.retry_policy(), RetryAfterPolicy::default());
        assert_eq!(
            config.scopes.names().collect::<Vec<_>>(),
            vec!["Get Album", "Get Track"]
        );
    }

    #[test]
    fn test_render_scope_template() {
        let config = DispatchConfig::parse(valid_toml()).unwrap();
        assert_eq!(
            config.scopes.render("Get Track", &config.probe_params).unwrap(),
            "https://api.example.com/v1/tracks/t1"
        );
        assert!(matches!(
            config.scopes.render("Get Artist", &config.probe_params),
            Err(Error::UnknownScope(_))
        ));
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let params = BTreeMap::from([("a".to_string(), "1".to_string())]);
        assert_eq!(render_template("http://x/{a}/{b}", &params), "http://x/1/{b}");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders("http://x/{a}/y/{b}"), vec!["a", "b"]);
        assert!(placeholders("http://x/plain").is_empty());
        assert!(placeholders("http://x/{unterminated").is_empty());
    }

    #[test]
    fn test_invalid_token_url_rejected() {
        let toml = r#"
[dispatch]
token_url = "accounts.example.com/api/token"

[scopes]
"Get Track" = "https://api.example.com/v1/tracks/1"
"#;
        let err = DispatchConfig::parse(toml).unwrap_err();
        assert!(err.to_string().contains("token_url must start with http"), "got: {err}");
    }

    #[test]
    fn test_zero_max_retries_rejected() {
        let toml = r#"
[dispatch]
token_url = "https://accounts.example.com/api/token"
max_retries = 0

[scopes]
"Get Track" = "https://api.example.com/v1/tracks/1"
"#;
        assert!(DispatchConfig::parse(toml).is_err());
    }

    #[test]
    fn test_empty_scopes_rejected() {
        let toml = r#"
[dispatch]
token_url = "https://accounts.example.com/api/token"

[scopes]
"#;
        let err = DispatchConfig::parse(toml).unwrap_err();
        assert!(err.to_string().contains("at least one scope"), "got: {err}");
    }

    #[test]
    fn test_missing_probe_param_rejected() {
        let toml = r#"
[dispatch]
token_url = "https://accounts.example.com/api/token"

[scopes]
"Get Track" = "https://api.example.com/v1/tracks/{track_id}"
"#;
        let err = DispatchConfig::parse(toml).unwrap_err();
        assert!(err.to_string().contains("{track_id}"), "got: {err}");
    }

    #[test]
    fn test_missing_probe_param_allowed_without_probe() {
        let toml = r#"
[dispatch]
token_url = "https://accounts.example.com/api/token"
probe_on_exchange = false

[scopes]
"Get Track" = "https://api.example.com/v1/tracks/{track_id}"
"#;
        assert!(DispatchConfig::parse(toml).is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(DispatchConfig::load(Path::new("/nonexistent/dispatch.toml")).is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "not valid {{{{ toml").unwrap();
        assert!(DispatchConfig::load(&path).is_err());
    }

    #[test]
    fn test_status_file_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.toml");
        std::fs::write(&path, valid_toml()).unwrap();

        unsafe { set_env(STATUS_FILE_ENV, "/var/lib/dispatch/status.json") };
        let config = DispatchConfig::load(&path).unwrap();
        unsafe { remove_env(STATUS_FILE_ENV) };

        assert_eq!(
            config.dispatch.status_file,
            PathBuf::from("/var/lib/dispatch/status.json")
        );
    }

    #[test]
    fn test_credentials_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("credentials.json");
        std::fs::write(&file, r#"[{"client_id":"from-file","client_secret":"x"}]"#).unwrap();

        unsafe { set_env(CREDENTIALS_ENV, r#"[{"client_id":"from-env","client_secret":"y"}]"#) };
        let creds = load_credentials(Some(&file)).unwrap();
        unsafe { remove_env(CREDENTIALS_ENV) };
        assert_eq!(creds[0].client_id, "from-env");

        let creds = load_credentials(Some(&file)).unwrap();
        assert_eq!(creds[0].client_id, "from-file");
    }

    #[test]
    fn test_credentials_missing_everywhere() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(CREDENTIALS_ENV) };
        let err = load_credentials(None).unwrap_err();
        assert!(err.to_string().contains(CREDENTIALS_ENV), "got: {err}");
        assert!(load_credentials(Some(Path::new("/nonexistent/creds.json"))).is_err());
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        assert_eq!(
            DispatchConfig::resolve_path(Some("/cli/wins.toml")),
            PathBuf::from("/cli/wins.toml")
        );
        assert_eq!(
            DispatchConfig::resolve_path(None),
            PathBuf::from("/env/should-lose.toml")
        );
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(DispatchConfig::resolve_path(None), PathBuf::from("dispatch.toml"));
    }
}
