use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use std::{
    net::IpAddr,
    time::Instant,
};

use crate::{
    ratelimit::QuotaDecision,
    registry::ClientRecord,
    router::Endpoint,
};

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    pub started_at: Instant,
    pub endpoint: Option<Endpoint>,
    pub client: Option<ClientRecord>,
    pub quota: Option<QuotaDecision>,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        client_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            request_id,
            method,
            uri,
            headers,
            body,
            client_ip,
            started_at: Instant::now(),
            endpoint: None,
            client: None,
            quota: None,
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client.as_ref().map(|c| c.client_id.as_str())
    }

    /// `x-api-key` wins over `Authorization: Bearer`.
    pub fn api_key(&self) -> Option<&str> {
        if let Some(key) = self
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return Some(key);
        }

        self.headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.strip_prefix("Bearer ")
                    .or_else(|| v.strip_prefix("bearer "))
            })
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}
