use async_trait::async_trait;
use std::{collections::BTreeSet, sync::Arc};
use tokio::time::Instant;

use crate::error::Result;

/// Who the caller is, as far as the identity provider knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: String,
    pub projects: BTreeSet<String>,
}

/// Turns a bearer token into an [`Identity`]. The gateway only uses the
/// result for its own admission check; backends re-validate the forwarded
/// header themselves.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<Option<Identity>>;
}

/// Resolver for deployments where the gateway does no identity lookup.
pub struct PassThroughIdentity;

#[async_trait]
impl IdentityResolver for PassThroughIdentity {
    async fn resolve(&self, _token: &str) -> Result<Option<Identity>> {
        Ok(None)
    }
}

/// Per-request authorization state. Built fresh for every inbound request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthorizationContext {
    /// The inbound `Authorization` header, exactly as received.
    pub raw_header: Option<String>,
    pub bearer_token: Option<String>,
    pub identity: Option<Identity>,
}

impl AuthorizationContext {
    pub fn anonymous() -> Self {
        AuthorizationContext::default()
    }

    pub fn from_header(raw_header: Option<String>) -> Self {
        let bearer_token = raw_header.as_deref().and_then(parse_bearer);
        AuthorizationContext {
            raw_header,
            bearer_token,
            identity: None,
        }
    }

    pub async fn resolve(
        raw_header: Option<String>,
        resolver: &dyn IdentityResolver,
    ) -> Result<Self> {
        let mut context = Self::from_header(raw_header);
        if let Some(token) = &context.bearer_token {
            context.identity = resolver.resolve(token).await?;
        }
        Ok(context)
    }
}

fn parse_bearer(header: &str) -> Option<String> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
        Some(token.to_string())
    } else {
        None
    }
}

/// Everything a delegated call needs to know about the operation that
/// caused it.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub authorization: Arc<AuthorizationContext>,
    pub deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(authorization: AuthorizationContext) -> Self {
        RequestContext {
            authorization: Arc::new(authorization),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn raw_authorization(&self) -> Option<&str> {
        self.authorization.raw_header.as_deref()
    }
}
