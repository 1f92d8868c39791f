use async_trait::async_trait;
use bytes::BytesMut;
use encoding_rs::Encoding;
use http::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::{Map, Value};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

use crate::{
    Document,
    auth::RequestContext,
    client_pool::ServiceClient,
    error::{GatewayError, Result},
    registry::DelegationRegistry,
};

/// One operation bound for one service.
#[derive(Clone)]
pub struct ExecutionRequest {
    pub document: Arc<Document>,
    pub variables: Map<String, Value>,
    pub context: RequestContext,
}

/// Runs a single GraphQL operation somewhere and returns the raw GraphQL
/// response envelope (`{data, errors}`).
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<Value>;
}

#[derive(Serialize)]
struct Payload<'a> {
    query: &'a str,
    variables: &'a Map<String, Value>,
}

/// Delegates operations to a remote service over `POST /graphql`.
pub struct RemoteExecutor {
    service: String,
    client: Arc<ServiceClient>,
    registry: Arc<DelegationRegistry>,
    timeout: Option<Duration>,
}

impl RemoteExecutor {
    pub fn new(
        service: impl Into<String>,
        client: Arc<ServiceClient>,
        registry: Arc<DelegationRegistry>,
        timeout: Option<Duration>,
    ) -> Self {
        RemoteExecutor {
            service: service.into(),
            client,
            registry,
            timeout,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Sends one operation and decodes the reply, returning the HTTP status
    /// alongside the body.
    pub(crate) async fn send(&self, request: &ExecutionRequest) -> Result<(u16, Value)> {
        let query = self.registry.print_cache.print(&request.document);
        let payload = Payload {
            query: &query,
            variables: &request.variables,
        };

        let call = async {
            let pooled = self
                .client
                .post_json(
                    &self.service,
                    &payload,
                    request.context.raw_authorization(),
                )
                .await?;
            let status = pooled.response.status().as_u16();
            let body = decode_response(&self.service, pooled.response).await?;
            Ok((status, body))
        };

        match effective_deadline(self.timeout, request.context.deadline) {
            Some(deadline) => tokio::time::timeout_at(deadline, call)
                .await
                .map_err(|_| GatewayError::Timeout {
                    service: self.service.clone(),
                })?,
            None => call.await,
        }
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<Value> {
        let (_status, body) = self.send(&request).await?;
        Ok(body)
    }
}

/// The earlier of the per-call timeout and the deadline inherited from the
/// inbound operation.
pub fn effective_deadline(timeout: Option<Duration>, inherited: Option<Instant>) -> Option<Instant> {
    let own = timeout.map(|timeout| Instant::now() + timeout);
    match (own, inherited) {
        (Some(own), Some(inherited)) => Some(own.min(inherited)),
        (own, inherited) => own.or(inherited),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    pub media_type: String,
    pub charset: String,
}

pub fn parse_content_type(raw: &str) -> ContentType {
    let mut parts = raw.split(';');
    let media_type = parts
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let charset = parts
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("charset"))
        .map(|(_, value)| value.trim().trim_matches('"').to_ascii_lowercase())
        .unwrap_or_else(|| "utf-8".to_string());

    ContentType {
        media_type,
        charset,
    }
}

/// Checks the content type of a service reply and decodes its body as JSON.
/// The body is collected chunk by chunk before decoding.
pub async fn decode_response(service: &str, mut response: reqwest::Response) -> Result<Value> {
    let protocol = |message: String| GatewayError::Protocol {
        service: service.to_string(),
        message,
    };

    let header = response
        .headers()
        .get(CONTENT_TYPE)
        .ok_or_else(|| GatewayError::ContentType {
            service: service.to_string(),
        })?;
    let header = header
        .to_str()
        .map_err(|_| protocol("content-type header is not valid text".to_string()))?;
    let content_type = parse_content_type(header);

    if content_type.media_type != "application/json" {
        return Err(protocol(format!(
            "unsupported content-type `{}` (status {})",
            content_type.media_type,
            response.status()
        )));
    }

    let encoding = Encoding::for_label(content_type.charset.as_bytes())
        .ok_or_else(|| protocol(format!("unknown charset `{}`", content_type.charset)))?;

    let mut body = BytesMut::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| GatewayError::Transport {
            service: service.to_string(),
            message: e.to_string(),
        })?
    {
        body.extend_from_slice(&chunk);
    }

    let (text, _, malformed) = encoding.decode(&body);
    if malformed {
        return Err(protocol(format!(
            "body is not valid {}",
            content_type.charset
        )));
    }

    serde_json::from_str(&text).map_err(|e| protocol(format!("invalid JSON body: {}", e)))
}
