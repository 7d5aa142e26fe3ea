//! Credential health check
//!
//! Standalone companion to the dispatcher, sharing its config and status file.
//!
//! `check` exchanges and probes every credential, replaces the status table
//! and prints a scope x credential summary. `fetch` sends one dispatched
//! request and prints the body, or `not found`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{Table, presets::UTF8_FULL};
use credential_rotator::config::USER_TOKEN_ENV;
use credential_rotator::credentials::load_credentials;
use credential_rotator::{AccessToken, DispatchConfig, Dispatcher, Fetched, StatusTable};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "credential-check", version, about = "Check and use dispatch credentials")]
struct Cli {
    /// Path to the dispatch config (falls back to CONFIG_PATH, then dispatch.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Command {
    /// Exchange and probe every credential, then rewrite the status file
    Check {
        /// Signed-in user's bearer token, probed as an extra column
        #[arg(long, env = USER_TOKEN_ENV, hide_env_values = true)]
        user_token: Option<String>,
    },
    /// Send one dispatched GET and print the response body
    Fetch {
        scope: String,
        /// Defaults to the scope's template filled from `probe_params`
        url: Option<String>,
    },
}

/// One row per scope, one column per checked credential.
fn render_table(table: &StatusTable, scopes: &[&str]) -> Table {
    let mut ids: Vec<String> = Vec::new();
    for record in table.records() {
        if !ids.contains(&record.credential_id) {
            ids.push(record.credential_id);
        }
    }

    let mut out = Table::new();
    out.load_preset(UTF8_FULL);

    let mut header = vec!["Scope".to_string()];
    header.extend(ids.iter().cloned());
    out.set_header(header);

    for scope in scopes {
        let mut row = vec![scope.to_string()];
        row.extend(ids.iter().map(|id| {
            table
                .get(id, scope)
                .map(|label| label.to_string())
                .unwrap_or_else(|| "N/A".into())
        }));
        out.add_row(row);
    }
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout carries only command output
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config_path = DispatchConfig::resolve_path(cli.config.as_deref());
    let config = DispatchConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let credentials = load_credentials(config.dispatch.credentials_file.as_deref())
        .context("failed to load credentials")?;
    let dispatcher = Dispatcher::new(config.clone(), credentials)
        .context("failed to build dispatcher")?;

    match cli.command {
        Command::Check { user_token } => {
            let user_token = user_token
                .filter(|t| !t.trim().is_empty())
                .map(AccessToken::bearer);
            let table = dispatcher
                .check_credentials(user_token.as_ref())
                .await
                .context("credential check failed")?;
            info!(
                records = table.len(),
                status_file = %dispatcher.status_store().path().display(),
                "status table replaced"
            );
            let scopes: Vec<&str> = dispatcher.scopes().names().collect();
            println!("{}", render_table(&table, &scopes));
        }
        Command::Fetch { scope, url } => {
            let url = match url {
                Some(url) => url,
                None => config.scopes.render(&scope, &config.probe_params)?,
            };
            match dispatcher.request(&url, &scope).await? {
                Fetched::Found(response) => {
                    let body = response
                        .text()
                        .await
                        .context("failed to read response body")?;
                    println!("{body}");
                }
                Fetched::NotFound => println!("not found"),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use credential_rotator::StatusLabel;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_fetch_with_config() {
        let cli = Cli::try_parse_from([
            "credential-check",
            "--config",
            "/etc/dispatch.toml",
            "fetch",
            "Get Track",
            "https://api.example.com/v1/tracks/1",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some("/etc/dispatch.toml"));
        assert_eq!(
            cli.command,
            Command::Fetch {
                scope: "Get Track".into(),
                url: Some("https://api.example.com/v1/tracks/1".into()),
            }
        );
    }

    #[test]
    fn fetch_url_is_optional() {
        let cli = Cli::try_parse_from(["credential-check", "fetch", "Get Album"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Fetch {
                scope: "Get Album".into(),
                url: None,
            }
        );
    }

    #[test]
    fn check_takes_user_token_flag() {
        let cli = Cli::try_parse_from([
            "credential-check",
            "check",
            "--user-token",
            "BQD-user",
            "--config",
            "dispatch.toml",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some("dispatch.toml"));
        assert_eq!(
            cli.command,
            Command::Check {
                user_token: Some("BQD-user".into()),
            }
        );
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(Cli::try_parse_from(["credential-check"]).is_err());
        assert!(Cli::try_parse_from(["credential-check", "fetch"]).is_err());
        assert!(Cli::try_parse_from(["credential-check", "purge"]).is_err());
        assert!(Cli::try_parse_from(["credential-check", "check", "--config"]).is_err());
    }

    #[test]
    fn table_has_one_row_per_scope() {
        let mut table = StatusTable::default();
        table.upsert("client-a", "Get Track", StatusLabel::Active);
        table.upsert("client-a", "Get Album", StatusLabel::Error { code: 403 });
        table.upsert("client-b", "Get Track", StatusLabel::Active);

        let rendered = render_table(&table, &["Get Album", "Get Track"]).to_string();
        let lines: Vec<&str> = rendered.lines().collect();

        let header = lines.iter().find(|l| l.contains("Scope")).unwrap();
        assert!(header.contains("client-a") && header.contains("client-b"));

        let album = lines.iter().find(|l| l.contains("Get Album")).unwrap();
        assert!(album.contains("Error: 403"));
        assert!(album.contains("N/A"), "client-b has no Get Album label");

        let track = lines.iter().find(|l| l.contains("Get Track")).unwrap();
        assert_eq!(track.matches("Active").count(), 2);
    }
}
