use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Session file prefix in the cache directory
const SESSION_FILE_PREFIX: &str = "session";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session id must not be empty")]
    EmptySessionId,

    #[error("session expires ({expires_at}) before it was created ({created_at})")]
    ExpiresBeforeCreated {
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },

    #[error("malformed session data: {0}")]
    Malformed(String),
}

/// One authenticated connection to a Vault.
///
/// Immutable once handed out: a refresh produces a new `Session`.
#[derive(Clone, PartialEq, Deserialize)]
#[serde(try_from = "SessionRecord")]
pub struct Session {
    session_id: String,
    user_id: i64,
    vault_id: i64,
    vault_name: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    metadata: BTreeMap<String, Value>,
}

/// Persisted shape of a session, validated on the way in.
#[derive(Deserialize)]
struct SessionRecord {
    session_id: String,
    user_id: i64,
    vault_id: i64,
    vault_name: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
}

impl TryFrom<SessionRecord> for Session {
    type Error = SessionError;

    fn try_from(record: SessionRecord) -> std::result::Result<Self, Self::Error> {
        let session = Session::new(
            record.session_id,
            record.user_id,
            record.vault_id,
            record.vault_name,
            record.created_at,
        )?;
        let session = match record.expires_at {
            Some(expires_at) => session.with_expires_at(expires_at)?,
            None => session,
        };
        Ok(Session {
            metadata: record.metadata,
            ..session
        })
    }
}

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        user_id: i64,
        vault_id: i64,
        vault_name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> std::result::Result<Self, SessionError> {
        let session_id = session_id.into();
        if session_id.is_empty() {
            return Err(SessionError::EmptySessionId);
        }
        Ok(Self {
            session_id,
            user_id,
            vault_id,
            vault_name: vault_name.into(),
            created_at,
            expires_at: None,
            metadata: BTreeMap::new(),
        })
    }

    pub fn with_expires_at(
        mut self,
        expires_at: DateTime<Utc>,
    ) -> std::result::Result<Self, SessionError> {
        if expires_at < self.created_at {
            return Err(SessionError::ExpiresBeforeCreated {
                created_at: self.created_at,
                expires_at,
            });
        }
        self.expires_at = Some(expires_at);
        Ok(self)
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn vault_id(&self) -> i64 {
        self.vault_id
    }

    pub fn vault_name(&self) -> &str {
        &self.vault_name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// How this session was obtained (`password`, `oauth`, ...), if recorded.
    pub fn auth_mode(&self) -> Option<&str> {
        self.metadata.get("auth_mode").and_then(Value::as_str)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// Remaining lifetime, clamped at zero. `None` when no expiry is known.
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| (expires_at - now).max(Duration::zero()))
    }

    /// Check if the session will expire within `threshold` and should be
    /// renewed. Sessions without an expiry never need it.
    pub fn should_refresh(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.time_until_expiry(now)
            .is_some_and(|remaining| remaining <= threshold)
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self, now: DateTime<Utc>) -> Option<i64> {
        self.time_until_expiry(now).map(|d| d.num_minutes())
    }

    /// Flat JSON-compatible form used for persistence.
    pub fn to_dict(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("session_id".into(), Value::String(self.session_id.clone()));
        map.insert("user_id".into(), Value::from(self.user_id));
        map.insert("vault_id".into(), Value::from(self.vault_id));
        map.insert("vault_name".into(), Value::String(self.vault_name.clone()));
        map.insert("created_at".into(), Value::String(format_timestamp(self.created_at)));
        map.insert(
            "expires_at".into(),
            self.expires_at
                .map(|t| Value::String(format_timestamp(t)))
                .unwrap_or(Value::Null),
        );
        map.insert(
            "metadata".into(),
            Value::Object(self.metadata.clone().into_iter().collect()),
        );
        map
    }

    pub fn from_dict(map: &Map<String, Value>) -> std::result::Result<Self, SessionError> {
        serde_json::from_value(Value::Object(map.clone())).map_err(|e| {
            // try_from failures come back wrapped in serde's message
            SessionError::Malformed(e.to_string())
        })
    }
}

/// RFC 3339 in UTC, with only as many fractional digits as the timestamp
/// carries, so persisted sessions restore exactly.
fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

impl Serialize for Session {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_dict().serialize(serializer)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .field("vault_id", &self.vault_id)
            .field("vault_name", &self.vault_name)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// On-disk copy of the current session, one file per Vault host.
#[derive(Debug, Clone)]
pub struct SessionStore {
    cache_dir: PathBuf,
    host: String,
}

impl SessionStore {
    pub fn new(cache_dir: PathBuf, host: impl Into<String>) -> Self {
        Self {
            cache_dir,
            host: host.into(),
        }
    }

    /// Load session from disk. Expired sessions are treated as absent.
    pub fn load(&self) -> Result<Option<Session>> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        let map: Map<String, Value> =
            serde_json::from_str(&contents).context("Failed to parse session file")?;
        let session = Session::from_dict(&map).context("Invalid session file")?;

        if session.is_expired(Utc::now()) {
            debug!(path = %path.display(), "Persisted session has expired");
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Save session to disk
    pub fn save(&self, session: &Session) -> Result<()> {
        let path = self.session_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&session.to_dict())?;
        write_private(&path, &contents)?;
        Ok(())
    }

    /// Remove the persisted session, if any
    pub fn clear(&self) -> Result<()> {
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn session_path(&self) -> PathBuf {
        let host: String = self
            .host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.cache_dir
            .join(format!("{}-{}.json", SESSION_FILE_PREFIX, host))
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn session() -> Session {
        Session::new("abc123", 1, 10, "V1", created()).unwrap()
    }

    #[test]
    fn test_empty_session_id_rejected() {
        assert_eq!(
            Session::new("", 1, 10, "V1", created()).unwrap_err(),
            SessionError::EmptySessionId
        );
    }

    #[test]
    fn test_expiry_before_creation_rejected() {
        let err = session()
            .with_expires_at(created() - Duration::seconds(1))
            .unwrap_err();
        assert!(matches!(err, SessionError::ExpiresBeforeCreated { .. }));
    }

    #[test]
    fn test_no_expiry_never_expires() {
        let s = session();
        let far_future = created() + Duration::days(3650);
        assert!(!s.is_expired(far_future));
        assert_eq!(s.time_until_expiry(far_future), None);
        assert!(!s.should_refresh(far_future, Duration::days(10_000)));
    }

    #[test]
    fn test_expiry_boundary() {
        let expires = created() + Duration::minutes(30);
        let s = session().with_expires_at(expires).unwrap();
        assert!(!s.is_expired(expires - Duration::nanoseconds(1)));
        assert!(s.is_expired(expires));
        assert_eq!(
            s.time_until_expiry(expires + Duration::minutes(5)),
            Some(Duration::zero())
        );
    }

    #[test]
    fn test_should_refresh_within_threshold() {
        let now = created();
        let s = session()
            .with_expires_at(now + Duration::seconds(200))
            .unwrap();
        assert!(s.should_refresh(now, Duration::seconds(300)));
        assert!(!s.should_refresh(now, Duration::seconds(100)));
        assert!(s.should_refresh(now, Duration::seconds(200)));
    }

    #[test]
    fn test_to_dict_shape() {
        let s = session()
            .with_expires_at(created() + Duration::hours(1))
            .unwrap()
            .with_metadata("auth_mode", "oauth");
        let dict = s.to_dict();
        assert_eq!(dict["session_id"], json!("abc123"));
        assert_eq!(dict["created_at"], json!("2025-03-01T12:00:00Z"));
        assert_eq!(dict["expires_at"], json!("2025-03-01T13:00:00Z"));
        assert_eq!(dict["metadata"], json!({"auth_mode": "oauth"}));
        assert_eq!(Session::from_dict(&dict).unwrap(), s);
    }

    #[test]
    fn test_timestamps_keep_sub_second_precision() {
        let at = created() + Duration::nanoseconds(123_456_789);
        let s = Session::new("abc123", 1, 10, "V1", at).unwrap();
        let dict = s.to_dict();
        assert_eq!(dict["created_at"], json!("2025-03-01T12:00:00.123456789Z"));
        assert_eq!(Session::from_dict(&dict).unwrap().created_at(), at);
    }

    #[test]
    fn test_from_dict_rejects_invalid() {
        let mut dict = session().to_dict();
        dict.insert("session_id".into(), json!(""));
        assert!(Session::from_dict(&dict).is_err());

        let mut dict = session().to_dict();
        dict.insert("expires_at".into(), json!("2025-03-01T11:00:00Z"));
        assert!(Session::from_dict(&dict).is_err());
    }

    #[test]
    fn test_debug_redacts_session_id() {
        let debug = format!("{:?}", session());
        assert!(!debug.contains("abc123"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf(), "myvault.veevavault.com");
        assert!(store.load().unwrap().is_none());

        let s = Session::new("live-session", 7, 42, "Quality", Utc::now())
            .unwrap()
            .with_metadata("auth_mode", "password");
        store.save(&s).unwrap();
        assert_eq!(store.load().unwrap(), Some(s));

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_store_skips_expired() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf(), "myvault.veevavault.com");
        let s = session().with_expires_at(created() + Duration::minutes(1)).unwrap();
        store.save(&s).unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_store_path_sanitizes_host() {
        let store = SessionStore::new(PathBuf::from("/tmp/cache"), "127.0.0.1:8080");
        assert_eq!(
            store.session_path(),
            PathBuf::from("/tmp/cache/session-127.0.0.1_8080.json")
        );
    }
}
