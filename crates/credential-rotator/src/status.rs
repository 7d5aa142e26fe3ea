//! File-backed credential status table
//!
//! The status file is a JSON array of `{"id": <client id>, "status": {<scope>: <label>}}`
//! entries. It is the only dispatch state that survives a restart and the
//! only state shared between worker processes and the standalone
//! credential-check utility, so both sides go through this module.
//!
//! Readers parse the file on demand and never fail: a missing or corrupt file
//! reads as an empty table, which leaves every credential eligible. Writers
//! hold an advisory exclusive lock on a sidecar `<file>.lock` for the whole
//! read-modify-write and replace the file with temp-file + rename, so a reader
//! never sees a partial file and concurrent writers do not lose updates.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Timelike, Utc};
use fs2::FileExt;
use resource_pool::HealthSource;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Label format written by older versions of the credential checker.
const LEGACY_RETRY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Persisted status of one credential for one scope.
///
/// Wire format: `Active`, `Rate-Limited: <RFC 3339 UTC>`, `Error: <status code>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StatusLabel {
    Active,
    /// `until: None` is a bare `Rate-Limited` with no known deadline.
    RateLimited { until: Option<DateTime<Utc>> },
    Error { code: u16 },
    /// Anything else is kept verbatim and does not block selection.
    Unrecognized(String),
}

impl StatusLabel {
    /// Rate-limited until `retry_after` from now, at the file's one-second precision.
    pub fn rate_limited_for(retry_after: Duration) -> Self {
        Self::rate_limited_from(Utc::now(), retry_after)
    }

    /// The deadline is rounded up to the next whole second, never down.
    fn rate_limited_from(now: DateTime<Utc>, retry_after: Duration) -> Self {
        let delta = chrono::Duration::from_std(retry_after).unwrap_or(chrono::Duration::MAX);
        let until = now
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let whole = until.with_nanosecond(0).unwrap_or(until);
        let until = if whole < until {
            whole
                .checked_add_signed(chrono::Duration::seconds(1))
                .unwrap_or(whole)
        } else {
            whole
        };
        StatusLabel::RateLimited { until: Some(until) }
    }

    /// Whether a credential with this label may be used at `now`.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            StatusLabel::Active | StatusLabel::Unrecognized(_) => true,
            StatusLabel::RateLimited { until: Some(until) } => now >= *until,
            StatusLabel::RateLimited { until: None } => false,
            StatusLabel::Error { .. } => false,
        }
    }
}

impl fmt::Display for StatusLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusLabel::Active => write!(f, "Active"),
            StatusLabel::RateLimited { until: Some(until) } => write!(
                f,
                "Rate-Limited: {}",
                until.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
            StatusLabel::RateLimited { until: None } => write!(f, "Rate-Limited"),
            StatusLabel::Error { code } => write!(f, "Error: {code}"),
            StatusLabel::Unrecognized(raw) => write!(f, "{raw}"),
        }
    }
}

impl FromStr for StatusLabel {
    type Err = Infallible;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        let label = raw.trim();
        if label == "Active" {
            return Ok(StatusLabel::Active);
        }
        if label == "Rate-Limited" {
            return Ok(StatusLabel::RateLimited { until: None });
        }
        let parsed = if let Some(ts) = label.strip_prefix("Rate-Limited:") {
            DateTime::parse_from_rfc3339(ts.trim())
                .ok()
                .map(|until| StatusLabel::RateLimited {
                    until: Some(until.with_timezone(&Utc)),
                })
        } else if let Some(ts) = label.strip_prefix("Rate-Limited; Retry at ") {
            NaiveDateTime::parse_from_str(ts.trim(), LEGACY_RETRY_FORMAT)
                .ok()
                .map(|until| StatusLabel::RateLimited {
                    until: Some(until.and_utc()),
                })
        } else if let Some(code) = label.strip_prefix("Error:") {
            code.trim()
                .parse::<u16>()
                .ok()
                .map(|code| StatusLabel::Error { code })
        } else {
            None
        };
        Ok(parsed.unwrap_or_else(|| StatusLabel::Unrecognized(raw.to_string())))
    }
}

impl From<String> for StatusLabel {
    fn from(raw: String) -> Self {
        match raw.parse() {
            Ok(label) => label,
            Err(never) => match never {},
        }
    }
}

impl From<StatusLabel> for String {
    fn from(label: StatusLabel) -> Self {
        label.to_string()
    }
}

/// All scope labels for one credential, as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialStatus {
    #[serde(alias = "Client ID")]
    pub id: String,
    #[serde(alias = "Status", default)]
    pub status: BTreeMap<String, StatusLabel>,
}

/// One `(credential, scope, label)` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub credential_id: String,
    pub scope: String,
    pub label: StatusLabel,
}

/// In-memory copy of the status file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusTable {
    entries: Vec<CredentialStatus>,
}

impl StatusTable {
    /// Label for a credential and scope, if recorded.
    pub fn get(&self, credential_id: &str, scope: &str) -> Option<&StatusLabel> {
        self.entries
            .iter()
            .find(|e| e.id == credential_id)
            .and_then(|e| e.status.get(scope))
    }

    /// Set the label for `(credential_id, scope)`, appending the credential if absent.
    pub fn upsert(&mut self, credential_id: &str, scope: &str, label: StatusLabel) {
        self.entry_mut(credential_id)
            .status
            .insert(scope.to_string(), label);
    }

    /// Replace every scope label of a credential.
    pub fn set_all(&mut self, credential_id: &str, labels: BTreeMap<String, StatusLabel>) {
        self.entry_mut(credential_id).status = labels;
    }

    /// Flattened rows in file order.
    pub fn records(&self) -> Vec<StatusRecord> {
        self.entries
            .iter()
            .flat_map(|entry| {
                entry.status.iter().map(|(scope, label)| StatusRecord {
                    credential_id: entry.id.clone(),
                    scope: scope.clone(),
                    label: label.clone(),
                })
            })
            .collect()
    }

    /// Number of `(credential, scope)` rows.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.status.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Eligibility view of one scope at `now`.
    pub fn for_scope<'a>(&'a self, scope: &'a str, now: DateTime<Utc>) -> ScopeStatus<'a> {
        ScopeStatus {
            table: self,
            scope,
            now,
        }
    }

    fn entry_mut(&mut self, credential_id: &str) -> &mut CredentialStatus {
        let idx = match self.entries.iter().position(|e| e.id == credential_id) {
            Some(idx) => idx,
            None => {
                self.entries.push(CredentialStatus {
                    id: credential_id.to_string(),
                    status: BTreeMap::new(),
                });
                self.entries.len() - 1
            }
        };
        &mut self.entries[idx]
    }
}

/// Passive health signal: the persisted status of each credential for one scope.
///
/// Credentials without a record are eligible.
pub struct ScopeStatus<'a> {
    table: &'a StatusTable,
    scope: &'a str,
    now: DateTime<Utc>,
}

impl HealthSource for ScopeStatus<'_> {
    fn eligible(&self, resource_id: &str) -> bool {
        self.table
            .get(resource_id, self.scope)
            .is_none_or(|label| label.is_eligible_at(self.now))
    }
}

/// Handle on the status file.
pub struct StatusStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current table. Missing or unparseable files read as empty.
    pub async fn read(&self) -> StatusTable {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => parse_table(&contents, &self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StatusTable::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read status file, treating as empty");
                StatusTable::default()
            }
        }
    }

    /// Set the label of one `(credential, scope)` record.
    pub async fn upsert(&self, credential_id: &str, scope: &str, label: StatusLabel) -> Result<()> {
        let credential_id = credential_id.to_string();
        let scope = scope.to_string();
        self.modify(move |table| table.upsert(&credential_id, &scope, label))
            .await
    }

    /// Set several scope labels of one credential in a single write.
    pub async fn upsert_many(
        &self,
        credential_id: &str,
        labels: BTreeMap<String, StatusLabel>,
    ) -> Result<()> {
        let credential_id = credential_id.to_string();
        self.modify(move |table| {
            for (scope, label) in labels {
                table.upsert(&credential_id, &scope, label);
            }
        })
        .await
    }

    /// Overwrite the whole table.
    pub async fn replace(&self, table: StatusTable) -> Result<()> {
        self.modify(move |current| *current = table).await
    }

    async fn modify<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut StatusTable) + Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || modify_locked(&path, f))
            .await
            .map_err(|e| Error::StatusStore(format!("status writer task failed: {e}")))?
    }
}

fn parse_table(contents: &str, path: &Path) -> StatusTable {
    if contents.trim().is_empty() {
        return StatusTable::default();
    }
    match serde_json::from_str(contents) {
        Ok(table) => table,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "status file is not valid JSON, treating as empty");
            StatusTable::default()
        }
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Read-modify-write under the cross-process advisory lock.
fn modify_locked<F>(path: &Path, f: F) -> Result<()>
where
    F: FnOnce(&mut StatusTable),
{
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(lock_path(path))
        .map_err(|e| Error::StatusStore(format!("opening status lock file: {e}")))?;
    lock_file
        .lock_exclusive()
        .map_err(|e| Error::StatusStore(format!("locking status file: {e}")))?;

    let mut table = match std::fs::read_to_string(path) {
        Ok(contents) => parse_table(&contents, path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => StatusTable::default(),
        Err(e) => return Err(Error::StatusStore(format!("reading status file: {e}"))),
    };
    f(&mut table);
    let result = write_atomic(path, &table);

    if let Err(e) = FileExt::unlock(&lock_file) {
        debug!(error = %e, "failed to release status lock explicitly");
    }
    result
}

/// Write the table to a temp file in the same directory, then rename over the target.
fn write_atomic(path: &Path, table: &StatusTable) -> Result<()> {
    let json = serde_json::to_string_pretty(table)
        .map_err(|e| Error::StatusStore(format!("serializing status table: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::StatusStore("status path has no file name".into()))?
        .to_string_lossy();
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    std::fs::write(&tmp_path, json.as_bytes())
        .map_err(|e| Error::StatusStore(format!("writing temp status file: {e}")))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| Error::StatusStore(format!("renaming temp status file: {e}")))?;

    debug!(path = %path.display(), records = table.len(), "persisted status table");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    #[test]
    fn labels_render_wire_format() {
        assert_eq!(StatusLabel::Active.to_string(), "Active");
        assert_eq!(StatusLabel::Error { code: 403 }.to_string(), "Error: 403");
        let until = Utc.with_ymd_and_hms(2026, 10, 19, 12, 30, 0).unwrap();
        assert_eq!(
            StatusLabel::RateLimited { until: Some(until) }.to_string(),
            "Rate-Limited: 2026-10-19T12:30:00Z"
        );
    }

    #[test]
    fn labels_parse_current_and_legacy_forms() {
        let until = Utc.with_ymd_and_hms(2026, 10, 19, 12, 30, 0).unwrap();
        assert_eq!(
            StatusLabel::from("Rate-Limited: 2026-10-19T12:30:00Z".to_string()),
            StatusLabel::RateLimited { until: Some(until) }
        );
        assert_eq!(
            StatusLabel::from("Rate-Limited; Retry at 2026-10-19 12:30:00".to_string()),
            StatusLabel::RateLimited { until: Some(until) }
        );
        assert_eq!(
            StatusLabel::from("Rate-Limited".to_string()),
            StatusLabel::RateLimited { until: None }
        );
        assert_eq!(
            StatusLabel::from("Error: 500".to_string()),
            StatusLabel::Error { code: 500 }
        );
        assert_eq!(
            StatusLabel::from("Paused by operator".to_string()),
            StatusLabel::Unrecognized("Paused by operator".into())
        );
    }

    #[test]
    fn eligibility_by_label() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 10, 19, 13, 0, 0).unwrap();

        assert!(StatusLabel::Active.is_eligible_at(now));
        assert!(!StatusLabel::RateLimited { until: Some(later) }.is_eligible_at(now));
        assert!(StatusLabel::RateLimited { until: Some(later) }.is_eligible_at(later));
        assert!(!StatusLabel::RateLimited { until: None }.is_eligible_at(now));
        assert!(!StatusLabel::Error { code: 400 }.is_eligible_at(now));
        assert!(StatusLabel::Unrecognized("?".into()).is_eligible_at(now));
    }

    #[test]
    fn rate_limited_for_sets_future_deadline() {
        let before = Utc::now();
        let StatusLabel::RateLimited { until: Some(until) } =
            StatusLabel::rate_limited_for(Duration::from_secs(5))
        else {
            panic!("expected a deadline");
        };
        let delta = until - before;
        assert!(delta >= chrono::Duration::seconds(4) && delta <= chrono::Duration::seconds(6));
    }

    #[test]
    fn rate_limited_deadline_rounds_up_to_whole_second() {
        let now = DateTime::parse_from_rfc3339("2026-03-01T12:00:00.250Z")
            .unwrap()
            .with_timezone(&Utc);
        let label = StatusLabel::rate_limited_from(now, Duration::from_secs(5));
        assert_eq!(label.to_string(), "Rate-Limited: 2026-03-01T12:00:06Z");
        assert!(!label.is_eligible_at(now + chrono::Duration::seconds(5)));

        let exact = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let label = StatusLabel::rate_limited_from(exact, Duration::from_secs(5));
        assert_eq!(label.to_string(), "Rate-Limited: 2026-03-01T12:00:05Z");
    }

    #[test]
    fn table_serializes_as_id_status_array() {
        let mut table = StatusTable::default();
        table.upsert("client-a", "Get Track", StatusLabel::Active);
        table.upsert("client-a", "Get Album", StatusLabel::Error { code: 403 });

        let json: serde_json::Value = serde_json::to_value(&table).unwrap();
        assert_eq!(json[0]["id"], "client-a");
        assert_eq!(json[0]["status"]["Get Track"], "Active");
        assert_eq!(json[0]["status"]["Get Album"], "Error: 403");
    }

    #[test]
    fn table_reads_legacy_field_names() {
        let table = parse_table(
            r#"[{"Client ID": "old", "Status": {"Get Track": "Rate-Limited"}}]"#,
            Path::new("legacy.json"),
        );
        assert_eq!(
            table.get("old", "Get Track"),
            Some(&StatusLabel::RateLimited { until: None })
        );
    }

    #[test]
    fn scope_status_is_a_health_source() {
        let now = Utc::now();
        let mut table = StatusTable::default();
        table.upsert("a", "X", StatusLabel::rate_limited_for(Duration::from_secs(60)));
        table.upsert("b", "X", StatusLabel::Active);
        table.upsert("c", "Y", StatusLabel::Error { code: 500 });

        let x = table.for_scope("X", now);
        assert!(!x.eligible("a"));
        assert!(x.eligible("b"));
        assert!(x.eligible("c"), "c has no record for X");
        assert!(x.eligible("unseen"));

        let y = table.for_scope("Y", now);
        assert!(y.eligible("a"), "a is only throttled for X");
        assert!(!y.eligible("c"));
    }

    #[tokio::test]
    async fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path().join("api_status.json"));
        assert!(store.read().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_status.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let store = StatusStore::new(&path);
        assert!(store.read().await.is_empty());
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path().join("api_status.json"));

        store.upsert("a", "X", StatusLabel::Active).await.unwrap();
        store.upsert("a", "X", StatusLabel::Active).await.unwrap();

        let table = store.read().await;
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.records(),
            vec![StatusRecord {
                credential_id: "a".into(),
                scope: "X".into(),
                label: StatusLabel::Active,
            }]
        );
    }

    #[tokio::test]
    async fn upsert_replaces_only_matching_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path().join("api_status.json"));

        store.upsert("a", "X", StatusLabel::Active).await.unwrap();
        store.upsert("a", "Y", StatusLabel::Active).await.unwrap();
        store.upsert("b", "X", StatusLabel::Active).await.unwrap();
        store
            .upsert("a", "X", StatusLabel::Error { code: 500 })
            .await
            .unwrap();

        let table = store.read().await;
        assert_eq!(table.len(), 3);
        assert_eq!(table.get("a", "X"), Some(&StatusLabel::Error { code: 500 }));
        assert_eq!(table.get("a", "Y"), Some(&StatusLabel::Active));
        assert_eq!(table.get("b", "X"), Some(&StatusLabel::Active));
    }

    #[tokio::test]
    async fn upsert_recovers_from_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_status.json");
        tokio::fs::write(&path, "garbage").await.unwrap();

        let store = StatusStore::new(&path);
        store.upsert("a", "X", StatusLabel::Active).await.unwrap();
        assert_eq!(store.read().await.len(), 1);
    }

    #[tokio::test]
    async fn upsert_many_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path().join("api_status.json"));

        let labels: BTreeMap<String, StatusLabel> = [
            ("X".to_string(), StatusLabel::Active),
            ("Y".to_string(), StatusLabel::Error { code: 404 }),
        ]
        .into_iter()
        .collect();
        store.upsert_many("a", labels).await.unwrap();
        assert_eq!(store.read().await.len(), 2);

        let mut fresh = StatusTable::default();
        fresh.upsert("b", "X", StatusLabel::Active);
        store.replace(fresh.clone()).await.unwrap();
        assert_eq!(store.read().await, fresh);
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_lose_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_status.json");

        // Two independent handles stand in for two worker processes
        let first = Arc::new(StatusStore::new(&path));
        let second = Arc::new(StatusStore::new(&path));

        let mut handles = vec![];
        for i in 0..20 {
            let store = if i % 2 == 0 { first.clone() } else { second.clone() };
            handles.push(tokio::spawn(async move {
                store
                    .upsert(&format!("client-{i}"), "X", StatusLabel::Active)
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let table = first.read().await;
        assert_eq!(table.len(), 20);

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: StatusTable = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 20);
    }
}
