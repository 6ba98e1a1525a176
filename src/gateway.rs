use std::{
    net::IpAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::{
        Body,
        to_bytes,
    },
    http::{
        HeaderMap,
        HeaderName,
        HeaderValue,
        Request,
    },
    response::Response,
};
use uuid::Uuid;

use crate::{
    circuit_breaker::CircuitBreaker,
    config::{
        GatewayConfig,
        LedgerBackendConfig,
        QuotaStoreConfig,
    },
    context::RequestContext,
    error::GatewayError,
    handlers::{self, Services},
    ledger::{
        UsageLedger,
        file::FileLedger,
        memory::MemoryLedger,
    },
    middleware::{
        GatewayMiddleware,
        auth::ApiKeyAuthMiddleware,
        logging::RequestLoggingMiddleware,
        rate_limit::RateLimitMiddleware,
        validation::RequestValidationMiddleware,
    },
    ratelimit::{
        PlanLimits,
        QuotaBackend,
        QuotaLimiter,
        in_memory::InMemoryQuotaBackend,
        redis_backend::RedisQuotaBackend,
    },
    registry::{
        ClientRegistry,
        KeyValidator,
        RegistryHandle,
    },
    report::ReportAggregator,
    upstream::{
        AnalysisBackend,
        HttpAnalysisBackend,
    },
};

const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Pluggable collaborators. Production builds them from config; tests inject
/// in-memory stores and mock backends.
pub struct GatewayParts {
    pub registry: ClientRegistry,
    pub quota_store: Arc<dyn QuotaBackend>,
    pub ledger: Arc<dyn UsageLedger>,
    pub backend: Arc<dyn AnalysisBackend>,
}

pub struct Gateway {
    middlewares: Vec<Arc<dyn GatewayMiddleware>>,
    services: Arc<Services>,
    max_body_bytes: usize,
    trust_forwarded_for: bool,
    clients_path: Option<PathBuf>,
    clients_reload: Duration,
}

impl Gateway {
    pub async fn from_config(config: GatewayConfig) -> anyhow::Result<Self> {
        let registry = match &config.clients_path {
            Some(path) => ClientRegistry::load(path).await?,
            None => {
                tracing::warn!(
                    "CLIENTS_PATH not set; using the built-in development client (key 'dev-key')"
                );
                ClientRegistry::development()
            }
        };
        tracing::info!(clients = registry.len(), "client registry loaded");

        let quota_store: Arc<dyn QuotaBackend> = match &config.quota.store {
            QuotaStoreConfig::InMemory => Arc::new(InMemoryQuotaBackend::new()),
            QuotaStoreConfig::Redis { url, key_prefix } => Arc::new(
                RedisQuotaBackend::new(url.clone(), key_prefix.clone())
                    .await
                    .map_err(|err| anyhow::anyhow!("failed to connect quota store: {err:?}"))?,
            ),
        };

        let ledger: Arc<dyn UsageLedger> = match &config.ledger {
            LedgerBackendConfig::InMemory => Arc::new(MemoryLedger::new()),
            LedgerBackendConfig::File { dir } => {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("failed to create ledger dir {}", dir.display()))?;
                Arc::new(FileLedger::new(dir.clone()))
            }
        };

        let backend: Arc<dyn AnalysisBackend> = Arc::new(
            HttpAnalysisBackend::new(&config.backend).context("failed to build backend client")?,
        );

        Ok(Self::with_parts(
            config,
            GatewayParts {
                registry,
                quota_store,
                ledger,
                backend,
            },
        ))
    }

    pub fn with_parts(config: GatewayConfig, parts: GatewayParts) -> Self {
        let registry = RegistryHandle::new(parts.registry);

        let limiter = QuotaLimiter::new(
            parts.quota_store,
            Arc::new(PlanLimits::from_config(&config.quota)),
            config.quota.global_window_seconds,
        );

        let middlewares: Vec<Arc<dyn GatewayMiddleware>> = vec![
            Arc::new(RequestLoggingMiddleware),
            Arc::new(RequestValidationMiddleware::new(config.validation.clone())),
            Arc::new(ApiKeyAuthMiddleware::new(KeyValidator::new(registry.clone()))),
            Arc::new(RateLimitMiddleware::new(
                limiter.clone(),
                config.quota.global_exempt_paths.clone(),
                config.quota.fail_open_on_error,
            )),
        ];

        let services = Services {
            registry,
            limiter,
            reports: ReportAggregator::new(parts.ledger.clone(), config.currency.clone()),
            ledger: parts.ledger,
            backend: parts.backend,
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            backend_timeout: Duration::from_millis(config.backend.timeout_ms),
            max_pdf_bytes: config.validation.max_pdf_bytes,
            per_minute: config.quota.per_minute.clone(),
            currency: config.currency,
        };

        Self {
            middlewares,
            services: Arc::new(services),
            max_body_bytes: config.validation.max_body_bytes,
            trust_forwarded_for: config.trust_forwarded_for,
            clients_path: config.clients_path,
            clients_reload: Duration::from_secs(config.clients_reload_secs),
        }
    }

    /// Idle quota-window eviction and, when configured, registry reloads.
    pub fn spawn_background_tasks(&self) {
        let limiter = self.services.limiter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = limiter.evict_idle().await;
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted idle quota windows");
                }
            }
        });

        if let Some(path) = self.clients_path.clone()
            && !self.clients_reload.is_zero()
        {
            let handle = self.services.registry.clone();
            let period = self.clients_reload;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match ClientRegistry::load(&path).await {
                        Ok(registry) => {
                            let clients = registry.len();
                            handle.replace(registry);
                            tracing::debug!(clients, "client registry reloaded");
                        }
                        Err(err) => tracing::error!(
                            error = %format!("{err:#}"),
                            path = %path.display(),
                            "client registry reload failed; keeping previous registry"
                        ),
                    }
                }
            });
        }
    }

    pub async fn handle_http(&self, request: Request<Body>, peer_ip: Option<IpAddr>) -> Response<Body> {
        let (parts, body) = request.into_parts();

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty() && v.len() <= 128)
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let max_capture = self.max_body_bytes.saturating_add(1);
        let body = match to_bytes(body, max_capture).await {
            Ok(body) => body,
            Err(_) => {
                let mut response = GatewayError::PayloadTooLarge.into_response_for(&request_id);
                attach_hardening_headers(&request_id, &mut response);
                return response;
            }
        };

        let client_ip = self.client_ip(&parts.headers, peer_ip);
        let mut ctx = RequestContext::new(
            request_id,
            parts.method,
            parts.uri,
            parts.headers,
            body,
            client_ip,
        );

        let mut executed = Vec::new();

        for (idx, middleware) in self.middlewares.iter().enumerate() {
            match middleware.on_request(&mut ctx).await {
                Ok(()) => executed.push(idx),
                Err(err) => {
                    tracing::debug!(
                        request_id = %ctx.request_id,
                        middleware = middleware.name(),
                        error = err.code(),
                        "middleware rejected request"
                    );
                    // Logging still reports the completion of rejected requests.
                    executed.push(idx);
                    let mut response = err.into_response_for(&ctx.request_id);
                    self.apply_response_middlewares(&executed, &ctx, &mut response)
                        .await;
                    attach_hardening_headers(&ctx.request_id, &mut response);
                    return response;
                }
            }
        }

        let mut response = match handlers::dispatch(&self.services, &ctx).await {
            Ok(response) => response,
            Err(err) => {
                if let GatewayError::Internal(detail) = &err {
                    tracing::error!(
                        request_id = %ctx.request_id,
                        error = %detail,
                        "request failed"
                    );
                }
                err.into_response_for(&ctx.request_id)
            }
        };

        self.apply_response_middlewares(&executed, &ctx, &mut response)
            .await;
        attach_hardening_headers(&ctx.request_id, &mut response);
        response
    }

    fn client_ip(&self, headers: &HeaderMap, peer_ip: Option<IpAddr>) -> Option<IpAddr> {
        if self.trust_forwarded_for
            && let Some(ip) = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|v| v.trim().parse::<IpAddr>().ok())
        {
            return Some(ip);
        }
        peer_ip
    }

    async fn apply_response_middlewares(
        &self,
        executed: &[usize],
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) {
        for idx in executed.iter().rev() {
            let middleware = &self.middlewares[*idx];
            if let Err(err) = middleware.on_response(ctx, response).await {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    middleware = middleware.name(),
                    error = %err.message(),
                    "middleware post-response hook failed"
                );
            }
        }
    }
}

fn attach_hardening_headers(request_id: &str, response: &mut Response<Body>) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }

    response.headers_mut().insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    response.headers_mut().insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    response.headers_mut().insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
}
