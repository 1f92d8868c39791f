use futures::future::join_all;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

/// A persistent HTTP client for one service origin. At most `depth` requests
/// are in flight on it at any time; further callers wait for a slot.
#[derive(Debug)]
pub struct ServiceClient {
    origin: String,
    graphql_url: Url,
    http: reqwest::Client,
    in_flight: Semaphore,
    depth: u32,
}

/// A response whose in-flight slot is held until the body has been read.
pub struct PooledResponse<'a> {
    pub response: reqwest::Response,
    _permit: SemaphorePermit<'a>,
}

impl ServiceClient {
    fn new(base_url: &Url, depth: usize) -> Result<Self> {
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(GatewayError::Configuration(format!(
                "unsupported scheme in `{}`",
                base_url
            )));
        }

        let graphql_url = base_url
            .join("/graphql")
            .map_err(|e| GatewayError::Configuration(format!("invalid url {}: {}", base_url, e)))?;
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(depth)
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build http client: {}", e)))?;

        Ok(ServiceClient {
            origin: base_url.origin().ascii_serialization(),
            graphql_url,
            http,
            in_flight: Semaphore::new(depth),
            depth: u32::try_from(depth).unwrap_or(u32::MAX),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn graphql_url(&self) -> &Url {
        &self.graphql_url
    }

    pub fn is_closed(&self) -> bool {
        self.in_flight.is_closed()
    }

    /// POSTs `body` as JSON to the service's `/graphql` endpoint, forwarding
    /// `authorization` untouched.
    pub async fn post_json<T>(
        &self,
        service: &str,
        body: &T,
        authorization: Option<&str>,
    ) -> Result<PooledResponse<'_>>
    where
        T: Serialize + ?Sized,
    {
        let permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| GatewayError::ClientClosed {
                origin: self.origin.clone(),
            })?;

        let mut request = self
            .http
            .post(self.graphql_url.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(body);
        if let Some(authorization) = authorization {
            request = request.header(AUTHORIZATION, authorization);
        }

        let response = request.send().await.map_err(|e| GatewayError::Transport {
            service: service.to_string(),
            message: e.to_string(),
        })?;

        Ok(PooledResponse {
            response,
            _permit: permit,
        })
    }

    /// Waits up to `grace` for in-flight requests to finish, then refuses new
    /// ones. The client is closed even when the wait runs out; the error
    /// only reports that requests were still pending.
    pub async fn close(&self, grace: Duration) -> Result<()> {
        if self.in_flight.is_closed() {
            return Err(GatewayError::ClientClosed {
                origin: self.origin.clone(),
            });
        }

        let drained = tokio::time::timeout(grace, self.in_flight.acquire_many(self.depth)).await;
        self.in_flight.close();

        match drained {
            Ok(Ok(permits)) => {
                permits.forget();
                Ok(())
            }
            Ok(Err(_)) => Err(GatewayError::ClientClosed {
                origin: self.origin.clone(),
            }),
            Err(_) => Err(GatewayError::Internal(format!(
                "requests to `{}` still in flight after {:?}",
                self.origin, grace
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub closed: usize,
    pub failed: usize,
}

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One [`ServiceClient`] per distinct service origin.
pub struct ServiceClientPool {
    depth: usize,
    drain_timeout: Duration,
    clients: Mutex<HashMap<String, Arc<ServiceClient>>>,
}

impl ServiceClientPool {
    pub fn new(depth: usize) -> Self {
        ServiceClientPool {
            depth: depth.max(1),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// How long [`ServiceClientPool::shutdown`] waits for each client's
    /// in-flight requests before closing it anyway.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Returns the pooled client for the origin of `base_url`, creating it
    /// on first use. Lookup and insert happen under one lock.
    pub fn client_for(&self, base_url: &Url) -> Result<Arc<ServiceClient>> {
        let origin = base_url.origin().ascii_serialization();
        let mut clients = self.clients();

        if let Some(client) = clients.get(&origin) {
            return Ok(client.clone());
        }

        let client = Arc::new(ServiceClient::new(base_url, self.depth)?);
        clients.insert(origin.clone(), client.clone());
        debug!(origin = %origin, depth = self.depth, "created pooled service client");

        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients().is_empty()
    }

    /// Closes and forgets every pooled client. A client that fails to close
    /// is logged and counted, never escalated.
    pub async fn shutdown(&self) -> ShutdownReport {
        let drained: Vec<Arc<ServiceClient>> =
            self.clients().drain().map(|(_, client)| client).collect();

        let results = join_all(drained.iter().map(|client| client.close(self.drain_timeout))).await;

        let mut report = ShutdownReport::default();
        for (client, result) in drained.iter().zip(results) {
            match result {
                Ok(()) => report.closed += 1,
                Err(e) => {
                    warn!(origin = %client.origin(), "failed to close service client: {}", e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, Arc<ServiceClient>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
