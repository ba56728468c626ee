use std::env;
use std::fmt;

use serde::Deserialize;
use uuid::Uuid;

use crate::error::{Result, TriggerError};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_bool(profile: &str, key: &str) -> Option<bool> {
    profiled_env_opt(profile, key).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

// ── Secret ────────────────────────────────────────────────────

/// Opaque credential. Never printed by `Debug` or `Display`.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw secret, for handing to the broker client only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

// ── Raw (inbound) config ──────────────────────────────────────

/// Broker list as the host stores it: a comma-separated string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BrokerList {
    Csv(String),
    List(Vec<String>),
}

impl Default for BrokerList {
    fn default() -> Self {
        BrokerList::List(Vec::new())
    }
}

impl BrokerList {
    /// Normalized addresses: each entry trimmed of whitespace and `/`, empties dropped.
    pub fn addresses(&self) -> Vec<String> {
        match self {
            BrokerList::Csv(s) => parse_brokers(s),
            BrokerList::List(items) => items.iter().flat_map(|s| parse_brokers(s)).collect(),
        }
    }
}

/// Split a comma-separated broker string into trimmed addresses.
pub fn parse_brokers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_matches('/').trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Connection settings as persisted by the host config store.
///
/// This is the loosely-typed inbound form; [`ConnectionConfig::from_raw`]
/// normalizes it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConnectionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub brokers: BrokerList,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<Secret>,
}

impl RawConnectionConfig {
    /// Build from environment variables (call `load_dotenv()` first).
    ///
    /// Profile is read from `KTRIGGER_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let mut raw = Self::default();
        raw.apply_env_overrides();
        raw
    }

    /// Apply environment variable overrides.
    ///
    /// - `KTRIGGER_ENABLED` -> `enabled`
    /// - `KTRIGGER_BROKERS` -> `brokers`
    /// - `KTRIGGER_TOPIC` -> `topic`
    /// - `KTRIGGER_GROUP_ID` -> `group_id`
    /// - `KTRIGGER_USERNAME` -> `username`
    /// - `KTRIGGER_PASSWORD` -> `password`
    pub fn apply_env_overrides(&mut self) {
        let p = env_or("KTRIGGER_PROFILE", "").to_uppercase();
        let p = p.as_str();
        if let Some(v) = profiled_env_bool(p, "KTRIGGER_ENABLED") {
            self.enabled = v;
        }
        if let Some(v) = profiled_env_opt(p, "KTRIGGER_BROKERS") {
            self.brokers = BrokerList::Csv(v);
        }
        if let Some(v) = profiled_env_opt(p, "KTRIGGER_TOPIC") {
            self.topic = v;
        }
        if let Some(v) = profiled_env_opt(p, "KTRIGGER_GROUP_ID") {
            self.group_id = Some(v);
        }
        if let Some(v) = profiled_env_opt(p, "KTRIGGER_USERNAME") {
            self.username = Some(v);
        }
        if let Some(v) = profiled_env_opt(p, "KTRIGGER_PASSWORD") {
            self.password = Some(Secret::new(v));
        }
    }
}

// ── Normalized config ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: Secret,
}

/// Normalized broker connection configuration.
///
/// Replaced wholesale whenever the host's persisted configuration changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub enabled: bool,
    pub brokers: Vec<String>,
    pub topic: String,
    /// Explicit consumer group; `None` means derive one at start.
    pub group_id: Option<String>,
    pub credentials: Option<Credentials>,
}

impl ConnectionConfig {
    pub fn from_raw(raw: RawConnectionConfig) -> Self {
        let credentials = match (raw.username, raw.password) {
            (Some(username), Some(secret)) if !username.trim().is_empty() => Some(Credentials {
                username: username.trim().to_string(),
                secret,
            }),
            _ => None,
        };
        Self {
            enabled: raw.enabled,
            brokers: raw.brokers.addresses(),
            topic: raw.topic.trim().to_string(),
            group_id: raw
                .group_id
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty()),
            credentials,
        }
    }

    /// A disabled configuration with nothing set.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            brokers: Vec::new(),
            topic: String::new(),
            group_id: None,
            credentials: None,
        }
    }

    /// Check the fields a consumer needs to start.
    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() {
            return Err(TriggerError::Config("no broker addresses configured".into()));
        }
        if self.topic.is_empty() {
            return Err(TriggerError::Config("no topic configured".into()));
        }
        Ok(())
    }

    /// Whether moving from `self` to `other` needs a new broker connection.
    ///
    /// Credential changes alone do not.
    pub fn requires_restart(&self, other: &ConnectionConfig) -> bool {
        self.brokers != other.brokers || self.topic != other.topic || self.group_id != other.group_id
    }

    /// The configured group, or a freshly derived one.
    pub fn resolve_group_id(&self) -> String {
        match &self.group_id {
            Some(g) => g.clone(),
            None => derive_group_id(&self.topic),
        }
    }

    pub fn brokers_csv(&self) -> String {
        self.brokers.join(",")
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!(
            enabled = self.enabled,
            brokers = %self.brokers_csv(),
            topic = %self.topic,
            group_id = self.group_id.as_deref().unwrap_or("(derived)"),
            sasl = self.credentials.is_some(),
            "connection config"
        );
    }

    /// Return a redacted view safe for status responses (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "enabled": self.enabled,
            "brokers": self.brokers,
            "topic": self.topic,
            "group_id": self.group_id,
            "username": self.credentials.as_ref().map(|c| c.username.clone()),
        })
    }
}

impl From<RawConnectionConfig> for ConnectionConfig {
    fn from(raw: RawConnectionConfig) -> Self {
        Self::from_raw(raw)
    }
}

/// Derive a consumer group unique to this process from the topic name.
pub fn derive_group_id(topic: &str) -> String {
    format!("ktrigger-{}-{}", topic, Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(brokers: &str, topic: &str) -> RawConnectionConfig {
        RawConnectionConfig {
            enabled: true,
            brokers: BrokerList::Csv(brokers.into()),
            topic: topic.into(),
            ..Default::default()
        }
    }

    #[test]
    fn parse_brokers_trims_separators() {
        assert_eq!(
            parse_brokers(" b1:9092/, b2:9092 ,,/b3:9092/ "),
            vec!["b1:9092", "b2:9092", "b3:9092"]
        );
        assert!(parse_brokers("  ").is_empty());
    }

    #[test]
    fn broker_list_accepts_list_form() {
        let list = BrokerList::List(vec!["b1:9092".into(), " b2:9092/".into()]);
        assert_eq!(list.addresses(), vec!["b1:9092", "b2:9092"]);
    }

    #[test]
    fn from_raw_drops_blank_group_id() {
        let mut r = raw("b1:9092", "builds");
        r.group_id = Some("  ".into());
        let cfg = ConnectionConfig::from_raw(r);
        assert_eq!(cfg.group_id, None);
        assert_eq!(cfg.brokers, vec!["b1:9092"]);
    }

    #[test]
    fn credentials_need_username_and_password() {
        let mut r = raw("b1:9092", "builds");
        r.username = Some("ci".into());
        assert!(ConnectionConfig::from_raw(r.clone()).credentials.is_none());

        r.password = Some(Secret::new("hunter2"));
        let creds = ConnectionConfig::from_raw(r).credentials.unwrap();
        assert_eq!(creds.username, "ci");
        assert_eq!(creds.secret.expose(), "hunter2");
    }

    #[test]
    fn validate_rejects_missing_brokers_or_topic() {
        let cfg = ConnectionConfig::from_raw(raw("", "builds"));
        assert!(matches!(cfg.validate(), Err(TriggerError::Config(_))));

        let cfg = ConnectionConfig::from_raw(raw("b1:9092", " "));
        assert!(matches!(cfg.validate(), Err(TriggerError::Config(_))));

        let cfg = ConnectionConfig::from_raw(raw("b1:9092", "builds"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn derived_group_contains_topic_and_suffix() {
        let cfg = ConnectionConfig::from_raw(raw("b1:9092", "builds"));
        let a = cfg.resolve_group_id();
        let b = cfg.resolve_group_id();
        assert!(a.contains("builds"));
        assert!(a.len() > "ktrigger-builds-".len());
        assert_ne!(a, b);
    }

    #[test]
    fn explicit_group_is_kept() {
        let mut r = raw("b1:9092", "builds");
        r.group_id = Some("ci-group".into());
        assert_eq!(ConnectionConfig::from_raw(r).resolve_group_id(), "ci-group");
    }

    #[test]
    fn requires_restart_ignores_credentials() {
        let a = ConnectionConfig::from_raw(raw("b1:9092", "builds"));
        let mut b = a.clone();
        b.credentials = Some(Credentials {
            username: "ci".into(),
            secret: Secret::new("s"),
        });
        assert!(!a.requires_restart(&b));

        b.topic = "other".into();
        assert!(a.requires_restart(&b));
    }

    #[test]
    fn secret_is_redacted() {
        let s = Secret::new("hunter2");
        assert_eq!(format!("{s:?}"), "Secret(***)");
        assert_eq!(format!("{s}"), "***");

        let mut r = raw("b1:9092", "builds");
        r.username = Some("ci".into());
        r.password = Some(s);
        let cfg = ConnectionConfig::from_raw(r);
        assert!(!format!("{cfg:?}").contains("hunter2"));
        assert!(!cfg.redacted_summary().to_string().contains("hunter2"));
    }

    #[test]
    fn parse_toml_both_broker_forms() {
        let cfg: RawConnectionConfig = toml::from_str(
            r#"
enabled = true
brokers = "b1:9092,b2:9092"
topic = "builds"
"#,
        )
        .unwrap();
        assert_eq!(cfg.brokers.addresses().len(), 2);

        let cfg: RawConnectionConfig = toml::from_str(
            r#"
brokers = ["b1:9092"]
topic = "builds"
password = "pw"
"#,
        )
        .unwrap();
        assert!(!cfg.enabled);
        assert_eq!(cfg.brokers.addresses(), vec!["b1:9092"]);
        assert_eq!(cfg.password.unwrap().expose(), "pw");
    }
}
