use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    net::IpAddr,
    path::Path,
    str::FromStr,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FEATURE_RISK_ASSESSMENT: &str = "risk_assessment";
pub const FEATURE_BILLING: &str = "billing";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Sandbox,
    Basic,
    Premium,
    Enterprise,
}

impl Plan {
    pub const ALL: [Plan; 4] = [Plan::Sandbox, Plan::Basic, Plan::Premium, Plan::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Basic => "basic",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        }
    }

    pub fn default_hourly_quota(&self) -> u64 {
        match self {
            Self::Sandbox => 50,
            Self::Basic => 200,
            Self::Premium => 1_000,
            Self::Enterprise => 5_000,
        }
    }

    pub fn default_price_per_request(&self) -> f64 {
        match self {
            Self::Sandbox => 0.0,
            Self::Basic => 0.50,
            Self::Premium => 0.35,
            Self::Enterprise => 0.25,
        }
    }

    pub fn next(&self) -> Option<Plan> {
        match self {
            Self::Sandbox => Some(Self::Basic),
            Self::Basic => Some(Self::Premium),
            Self::Premium => Some(Self::Enterprise),
            Self::Enterprise => None,
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Ok(Self::Sandbox),
            "basic" => Ok(Self::Basic),
            "premium" => Ok(Self::Premium),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown plan: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentModel {
    #[default]
    Free,
    Prepaid,
    Postpaid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub api_key: String,
    pub client_id: String,
    pub display_name: String,
    pub plan: Plan,
    pub hourly_quota: u64,
    pub price_per_request: f64,
    pub active: bool,
    pub features: BTreeSet<String>,
    pub payment_model: PaymentModel,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ClientRecord {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Never log the full secret: at most 8 chars, and never more than half the key.
pub fn key_prefix(key: &str) -> String {
    let shown = (key.chars().count() / 2).min(8);
    let prefix: String = key.chars().take(shown).collect();
    format!("{prefix}...")
}

/// On-disk shape of a client entry. Quota and price fall back to plan defaults.
#[derive(Debug, Deserialize)]
struct ClientEntry {
    api_key: String,
    client_id: String,
    #[serde(default)]
    display_name: Option<String>,
    plan: Plan,
    #[serde(default)]
    hourly_quota: Option<u64>,
    #[serde(default)]
    price_per_request: Option<f64>,
    #[serde(default = "default_active")]
    active: bool,
    #[serde(default = "default_features")]
    features: BTreeSet<String>,
    #[serde(default)]
    payment_model: PaymentModel,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    clients: Vec<ClientEntry>,
}

fn default_active() -> bool {
    true
}

fn default_features() -> BTreeSet<String> {
    [FEATURE_RISK_ASSESSMENT, FEATURE_BILLING]
        .into_iter()
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    by_key: HashMap<String, ClientRecord>,
}

impl ClientRegistry {
    pub fn new(records: Vec<ClientRecord>) -> Result<Self> {
        let mut by_key = HashMap::with_capacity(records.len());
        for record in records {
            if record.api_key.trim().is_empty() {
                return Err(anyhow!("client {} has an empty api key", record.client_id));
            }
            if record.client_id.trim().is_empty() {
                return Err(anyhow!("client entry with empty client_id"));
            }
            if record.hourly_quota == 0 {
                return Err(anyhow!("client {} has hourly_quota 0", record.client_id));
            }
            if !(record.price_per_request >= 0.0) {
                return Err(anyhow!(
                    "client {} has a negative price_per_request",
                    record.client_id
                ));
            }
            let client_id = record.client_id.clone();
            if by_key.insert(record.api_key.clone(), record).is_some() {
                return Err(anyhow!("duplicate api key for client {client_id}"));
            }
        }
        Ok(Self { by_key })
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: RegistryFile =
            serde_json::from_str(raw).context("invalid client registry document")?;
        let records = file
            .clients
            .into_iter()
            .map(|entry| ClientRecord {
                display_name: entry
                    .display_name
                    .unwrap_or_else(|| entry.client_id.clone()),
                hourly_quota: entry
                    .hourly_quota
                    .unwrap_or_else(|| entry.plan.default_hourly_quota()),
                price_per_request: entry
                    .price_per_request
                    .unwrap_or_else(|| entry.plan.default_price_per_request()),
                api_key: entry.api_key,
                client_id: entry.client_id,
                plan: entry.plan,
                active: entry.active,
                features: entry.features,
                payment_model: entry.payment_model,
                expires_at: entry.expires_at,
            })
            .collect();
        Self::new(records)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read client registry {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn development() -> Self {
        let record = ClientRecord {
            api_key: "dev-key".to_string(),
            client_id: "dev".to_string(),
            display_name: "Development client".to_string(),
            plan: Plan::Sandbox,
            hourly_quota: Plan::Sandbox.default_hourly_quota(),
            price_per_request: Plan::Sandbox.default_price_per_request(),
            active: true,
            features: default_features(),
            payment_model: PaymentModel::Free,
            expires_at: None,
        };
        Self {
            by_key: HashMap::from([(record.api_key.clone(), record)]),
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn lookup(&self, presented: &str) -> Option<&ClientRecord> {
        // Scan every entry so lookup time does not depend on which key matched.
        let mut found = None;
        for (candidate, record) in &self.by_key {
            if timing_safe_eq(candidate.as_bytes(), presented.as_bytes()) {
                found = Some(record);
            }
        }
        found
    }
}

/// Shared, swappable view of the registry. Reloads replace the whole object.
#[derive(Clone)]
pub struct RegistryHandle {
    current: Arc<RwLock<Arc<ClientRegistry>>>,
}

impl RegistryHandle {
    pub fn new(registry: ClientRegistry) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(registry))),
        }
    }

    pub fn snapshot(&self) -> Arc<ClientRegistry> {
        self.current.read().clone()
    }

    pub fn replace(&self, registry: ClientRegistry) {
        *self.current.write() = Arc::new(registry);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("API key required")]
    MissingKey,
    #[error("invalid API key")]
    UnknownKey,
    #[error("API key suspended")]
    Suspended,
    #[error("API key expired")]
    Expired,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingKey => "missing_api_key",
            Self::UnknownKey => "invalid_api_key",
            Self::Suspended => "api_key_suspended",
            Self::Expired => "api_key_expired",
        }
    }
}

#[derive(Clone)]
pub struct KeyValidator {
    registry: RegistryHandle,
}

impl KeyValidator {
    pub fn new(registry: RegistryHandle) -> Self {
        Self { registry }
    }

    pub fn validate(
        &self,
        key: Option<&str>,
        client_ip: Option<IpAddr>,
    ) -> Result<ClientRecord, AuthError> {
        self.validate_at(key, client_ip, Utc::now())
    }

    pub fn validate_at(
        &self,
        key: Option<&str>,
        client_ip: Option<IpAddr>,
        now: DateTime<Utc>,
    ) -> Result<ClientRecord, AuthError> {
        let outcome = self.check(key, now);
        let key_prefix = key.map(key_prefix).unwrap_or_default();

        match &outcome {
            Ok(record) => tracing::info!(
                target: "audit",
                event = "auth_success",
                key_prefix = %key_prefix,
                client_id = %record.client_id,
                plan = %record.plan,
                client_ip = ?client_ip,
                "API key accepted"
            ),
            Err(err) => tracing::warn!(
                target: "audit",
                event = "auth_failure",
                reason = err.code(),
                key_prefix = %key_prefix,
                client_ip = ?client_ip,
                "API key rejected"
            ),
        }

        outcome
    }

    fn check(&self, key: Option<&str>, now: DateTime<Utc>) -> Result<ClientRecord, AuthError> {
        let key = key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(AuthError::MissingKey)?;

        let registry = self.registry.snapshot();
        let record = registry.lookup(key).ok_or(AuthError::UnknownKey)?;

        if !record.active {
            return Err(AuthError::Suspended);
        }
        if record.is_expired_at(now) {
            return Err(AuthError::Expired);
        }

        Ok(record.clone())
    }
}

fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    let max = a.len().max(b.len());
    let mut diff = (a.len() != b.len()) as u8;

    for idx in 0..max {
        let av = *a.get(idx).unwrap_or(&0);
        let bv = *b.get(idx).unwrap_or(&0);
        diff |= av ^ bv;
    }

    diff == 0
}

#[cfg(test)]
pub(crate) fn test_client(key: &str, client_id: &str, plan: Plan) -> ClientRecord {
    ClientRecord {
        api_key: key.to_string(),
        client_id: client_id.to_string(),
        display_name: client_id.to_string(),
        plan,
        hourly_quota: plan.default_hourly_quota(),
        price_per_request: plan.default_price_per_request(),
        active: true,
        features: default_features(),
        payment_model: PaymentModel::Prepaid,
        expires_at: None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn validator(records: Vec<ClientRecord>) -> KeyValidator {
        KeyValidator::new(RegistryHandle::new(ClientRegistry::new(records).unwrap()))
    }

    #[test]
    fn accepts_active_key() {
        let v = validator(vec![test_client("key-basic-0001", "acme", Plan::Basic)]);
        let record = v.validate(Some("key-basic-0001"), None).unwrap();
        assert_eq!(record.client_id, "acme");
        assert_eq!(record.plan, Plan::Basic);
    }

    #[test]
    fn rejects_missing_unknown_suspended_and_expired_keys() {
        let mut suspended = test_client("key-suspended", "sus", Plan::Basic);
        suspended.active = false;
        let mut expired = test_client("key-expired", "old", Plan::Premium);
        expired.expires_at = Some(Utc::now() - Duration::days(1));
        let v = validator(vec![suspended, expired]);

        assert_eq!(v.validate(None, None).unwrap_err(), AuthError::MissingKey);
        assert_eq!(v.validate(Some("  "), None).unwrap_err(), AuthError::MissingKey);
        assert_eq!(v.validate(Some("nope"), None).unwrap_err(), AuthError::UnknownKey);
        assert_eq!(
            v.validate(Some("key-suspended"), None).unwrap_err(),
            AuthError::Suspended
        );
        assert_eq!(v.validate(Some("key-expired"), None).unwrap_err(), AuthError::Expired);
    }

    #[test]
    fn future_expiry_is_still_valid() {
        let mut record = test_client("key-later", "later", Plan::Sandbox);
        record.expires_at = Some(Utc::now() + Duration::days(30));
        let v = validator(vec![record]);
        assert!(v.validate(Some("key-later"), None).is_ok());
    }

    #[test]
    fn parses_registry_document_with_plan_defaults() {
        let registry = ClientRegistry::from_json(
            r#"{"clients": [
                {"api_key": "k1", "client_id": "c1", "plan": "premium"},
                {"api_key": "k2", "client_id": "c2", "plan": "sandbox",
                 "hourly_quota": 7, "price_per_request": 1.5, "active": false,
                 "features": ["billing"], "payment_model": "postpaid"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        let c1 = registry.lookup("k1").unwrap();
        assert_eq!(c1.hourly_quota, 1_000);
        assert_eq!(c1.display_name, "c1");
        assert!(c1.has_feature(FEATURE_RISK_ASSESSMENT));

        let c2 = registry.lookup("k2").unwrap();
        assert_eq!(c2.hourly_quota, 7);
        assert!(!c2.active);
        assert!(!c2.has_feature(FEATURE_RISK_ASSESSMENT));
        assert_eq!(c2.payment_model, PaymentModel::Postpaid);
    }

    #[test]
    fn rejects_invalid_registry_entries() {
        assert!(
            ClientRegistry::from_json(
                r#"{"clients": [{"api_key": "k", "client_id": "c", "plan": "basic", "hourly_quota": 0}]}"#
            )
            .is_err()
        );
        assert!(
            ClientRegistry::from_json(
                r#"{"clients": [
                    {"api_key": "k", "client_id": "a", "plan": "basic"},
                    {"api_key": "k", "client_id": "b", "plan": "basic"}
                ]}"#
            )
            .is_err()
        );
    }

    #[test]
    fn replacement_is_observed_by_validator() {
        let handle = RegistryHandle::new(ClientRegistry::development());
        let v = KeyValidator::new(handle.clone());
        assert!(v.validate(Some("dev-key"), None).is_ok());

        let mut suspended = test_client("dev-key", "dev", Plan::Sandbox);
        suspended.active = false;
        handle.replace(ClientRegistry::new(vec![suspended]).unwrap());
        assert_eq!(v.validate(Some("dev-key"), None).unwrap_err(), AuthError::Suspended);
    }

    #[test]
    fn key_prefix_never_contains_full_secret() {
        assert_eq!(key_prefix("sk_live_abcdefghijkl"), "sk_live_...");
        assert_eq!(key_prefix("dev-key"), "dev...");
        assert_eq!(key_prefix("abcd1234"), "abcd...");
        assert_eq!(key_prefix("x"), "...");

        for key in ["dev-key", "abcd1234", "k1", "sk_live_abcdefghijkl"] {
            let logged = key_prefix(key);
            assert!(!logged.contains(key), "{key} leaked as {logged}");
        }
    }
}
