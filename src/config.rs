use anyhow::{Context, Result, anyhow};
use std::{
    env,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
};

use crate::registry::Plan;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub clients_path: Option<PathBuf>,
    pub clients_reload_secs: u64,
    pub trust_forwarded_for: bool,
    pub currency: String,
    pub log_format: LogFormat,
    pub validation: ValidationConfig,
    pub quota: QuotaConfig,
    pub backend: BackendConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub ledger: LedgerBackendConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unsupported LOG_FORMAT: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub max_body_bytes: usize,
    pub max_pdf_bytes: usize,
    pub allowed_methods: Vec<String>,
    pub max_headers: usize,
}

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub global_limit: u64,
    pub global_window_seconds: u64,
    pub anonymous_hourly_limit: u64,
    pub per_minute: PerMinuteLimits,
    pub global_exempt_paths: Vec<String>,
    pub store: QuotaStoreConfig,
    pub fail_open_on_error: bool,
}

#[derive(Debug, Clone)]
pub enum QuotaStoreConfig {
    InMemory,
    Redis { url: String, key_prefix: String },
}

/// Analysis requests allowed per minute, by plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerMinuteLimits {
    pub sandbox: u64,
    pub basic: u64,
    pub premium: u64,
    pub enterprise: u64,
}

impl Default for PerMinuteLimits {
    fn default() -> Self {
        Self {
            sandbox: 2,
            basic: 5,
            premium: 20,
            enterprise: 50,
        }
    }
}

impl PerMinuteLimits {
    pub fn for_plan(&self, plan: Plan) -> u64 {
        match plan {
            Plan::Sandbox => self.sandbox,
            Plan::Basic => self.basic,
            Plan::Premium => self.premium,
            Plan::Enterprise => self.enterprise,
        }
    }

    /// Parses `plan=limit` pairs; plans not mentioned keep their defaults.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut out = Self::default();
        for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
            let (plan, limit) = chunk
                .split_once('=')
                .ok_or_else(|| anyhow!("invalid per-minute entry: {chunk}"))?;
            let plan = plan.parse::<Plan>().map_err(|e| anyhow!(e))?;
            let limit = limit
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid per-minute limit for {plan}"))?;
            if limit == 0 {
                return Err(anyhow!("per-minute limit for {plan} must be > 0"));
            }
            match plan {
                Plan::Sandbox => out.sandbox = limit,
                Plan::Basic => out.basic = limit,
                Plan::Premium => out.premium = limit,
                Plan::Enterprise => out.enterprise = limit,
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_seconds: u64,
    pub half_open_max_requests: u32,
}

#[derive(Debug, Clone)]
pub enum LedgerBackendConfig {
    InMemory,
    File { dir: PathBuf },
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            clients_path: None,
            clients_reload_secs: 0,
            trust_forwarded_for: false,
            currency: "EUR".to_string(),
            log_format: LogFormat::Compact,
            validation: ValidationConfig {
                max_body_bytes: 20 * 1024 * 1024,
                max_pdf_bytes: 10 * 1024 * 1024,
                allowed_methods: vec!["GET".to_string(), "POST".to_string()],
                max_headers: 128,
            },
            quota: QuotaConfig {
                global_limit: 100,
                global_window_seconds: 15 * 60,
                anonymous_hourly_limit: 10,
                per_minute: PerMinuteLimits::default(),
                global_exempt_paths: vec![
                    "/health".to_string(),
                    "/v1/plans".to_string(),
                    "/v1/validate-key".to_string(),
                ],
                store: QuotaStoreConfig::InMemory,
                fail_open_on_error: false,
            },
            backend: BackendConfig {
                url: "http://127.0.0.1:5678/webhook/risk-assessment".to_string(),
                timeout_ms: 60_000,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                open_seconds: 30,
                half_open_max_requests: 1,
            },
            ledger: LedgerBackendConfig::File {
                dir: PathBuf::from("data/usage"),
            },
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| d.bind_addr.to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let log_format = match env::var("LOG_FORMAT") {
            Ok(raw) => raw.parse::<LogFormat>().map_err(|e| anyhow!(e))?,
            Err(_) => d.log_format,
        };

        let validation = ValidationConfig {
            max_body_bytes: parse_env("MAX_BODY_BYTES", d.validation.max_body_bytes)?,
            max_pdf_bytes: parse_env("MAX_PDF_BYTES", d.validation.max_pdf_bytes)?,
            allowed_methods: parse_csv("ALLOWED_METHODS", "GET,POST")
                .into_iter()
                .map(|m| m.to_ascii_uppercase())
                .collect(),
            max_headers: parse_env("MAX_HEADERS", d.validation.max_headers)?,
        };

        let store = match env::var("RATE_LIMIT_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" | "in_memory" => QuotaStoreConfig::InMemory,
            "redis" => {
                let url = env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
                let key_prefix = env::var("REDIS_KEY_PREFIX")
                    .unwrap_or_else(|_| "gateway:quota".to_string());
                QuotaStoreConfig::Redis { url, key_prefix }
            }
            other => return Err(anyhow!("unsupported RATE_LIMIT_BACKEND: {other}")),
        };

        let per_minute = match env::var("PER_MINUTE_LIMITS") {
            Ok(raw) => PerMinuteLimits::parse(&raw).context("invalid PER_MINUTE_LIMITS")?,
            Err(_) => d.quota.per_minute,
        };

        let quota = QuotaConfig {
            global_limit: parse_env("GLOBAL_RATE_LIMIT", d.quota.global_limit)?.max(1),
            global_window_seconds: parse_env(
                "GLOBAL_WINDOW_SECONDS",
                d.quota.global_window_seconds,
            )?
            .max(1),
            anonymous_hourly_limit: parse_env(
                "ANONYMOUS_HOURLY_LIMIT",
                d.quota.anonymous_hourly_limit,
            )?
            .max(1),
            per_minute,
            global_exempt_paths: parse_csv(
                "GLOBAL_EXEMPT_PATHS",
                &d.quota.global_exempt_paths.join(","),
            ),
            store,
            fail_open_on_error: parse_env("RATE_LIMIT_FAIL_OPEN", d.quota.fail_open_on_error)?,
        };

        let backend_url = env::var("BACKEND_URL").unwrap_or(d.backend.url);
        if !backend_url.starts_with("http://") && !backend_url.starts_with("https://") {
            return Err(anyhow!("BACKEND_URL must be an http(s) URL"));
        }
        let backend = BackendConfig {
            url: backend_url,
            timeout_ms: parse_env("BACKEND_TIMEOUT_MS", d.backend.timeout_ms)?.max(100),
        };

        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: parse_env(
                "CB_FAILURE_THRESHOLD",
                d.circuit_breaker.failure_threshold,
            )?
            .max(1),
            open_seconds: parse_env("CB_OPEN_SECONDS", d.circuit_breaker.open_seconds)?,
            half_open_max_requests: parse_env(
                "CB_HALF_OPEN_MAX",
                d.circuit_breaker.half_open_max_requests,
            )?
            .max(1),
        };

        let ledger = match env::var("LEDGER_BACKEND")
            .unwrap_or_else(|_| "file".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" | "in_memory" => LedgerBackendConfig::InMemory,
            "file" => LedgerBackendConfig::File {
                dir: env::var("LEDGER_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("data/usage")),
            },
            other => return Err(anyhow!("unsupported LEDGER_BACKEND: {other}")),
        };

        Ok(Self {
            bind_addr,
            clients_path: env::var("CLIENTS_PATH").ok().map(PathBuf::from),
            clients_reload_secs: parse_env("CLIENTS_RELOAD_SECS", d.clients_reload_secs)?,
            trust_forwarded_for: parse_env("TRUST_FORWARDED_FOR", d.trust_forwarded_for)?,
            currency: env::var("CURRENCY").unwrap_or(d.currency),
            log_format,
            validation,
            quota,
            backend,
            circuit_breaker,
            ledger,
        })
    }
}

fn parse_csv(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    parse_value(key, env::var(key).ok(), default)
}

/// Unset or blank keeps the default; anything else must parse.
fn parse_value<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(value) => value
            .parse::<T>()
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("invalid {key}: {value:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_minute_limits_override_listed_plans_only() {
        let limits = PerMinuteLimits::parse("basic=9, enterprise=100").unwrap();
        assert_eq!(limits.for_plan(Plan::Sandbox), 2);
        assert_eq!(limits.for_plan(Plan::Basic), 9);
        assert_eq!(limits.for_plan(Plan::Premium), 20);
        assert_eq!(limits.for_plan(Plan::Enterprise), 100);
    }

    #[test]
    fn per_minute_limits_reject_garbage() {
        assert!(PerMinuteLimits::parse("gold=3").is_err());
        assert!(PerMinuteLimits::parse("basic").is_err());
        assert!(PerMinuteLimits::parse("basic=0").is_err());
        assert!(PerMinuteLimits::parse("basic=x").is_err());
    }

    #[test]
    fn defaults_match_documented_tiers() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.quota.global_limit, 100);
        assert_eq!(cfg.quota.global_window_seconds, 900);
        assert_eq!(cfg.quota.anonymous_hourly_limit, 10);
        assert_eq!(cfg.backend.timeout_ms, 60_000);
        assert!(cfg.quota.global_exempt_paths.iter().any(|p| p == "/v1/validate-key"));
    }

    #[test]
    fn malformed_values_fail_with_the_key_name() {
        let err = parse_value("BACKEND_TIMEOUT_MS", Some("5s".to_string()), 60_000u64).unwrap_err();
        assert!(format!("{err:#}").contains("invalid BACKEND_TIMEOUT_MS"));

        let err = parse_value("RATE_LIMIT_FAIL_OPEN", Some("yes".to_string()), false).unwrap_err();
        assert!(format!("{err:#}").contains("RATE_LIMIT_FAIL_OPEN"));
    }

    #[test]
    fn unset_or_blank_values_keep_defaults() {
        assert_eq!(parse_value("CB_OPEN_SECONDS", None, 30u64).unwrap(), 30);
        assert_eq!(parse_value("CB_OPEN_SECONDS", Some("  ".to_string()), 30u64).unwrap(), 30);
        assert_eq!(parse_value("CB_OPEN_SECONDS", Some(" 45 ".to_string()), 30u64).unwrap(), 45);
        assert!(parse_value("TRUST_FORWARDED_FOR", Some("true".to_string()), false).unwrap());
    }

    #[test]
    fn env_lookup_propagates_parse_errors() {
        let key = "RISK_GATEWAY_TEST_MALFORMED_TIMEOUT";
        // SAFETY: the key is unique to this test and read by nothing else.
        unsafe { env::set_var(key, "5s") };
        let result = parse_env::<u64>(key, 60_000);
        unsafe { env::remove_var(key) };

        assert!(result.is_err());
        assert_eq!(parse_env::<u64>(key, 60_000).unwrap(), 60_000);
    }
}
