/// Everything that can go wrong between reading the config and answering a
/// delegated operation.
///
/// The enum is `Clone` so a single failed round-trip can be reported to every
/// request that was coalesced into it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("introspection of service `{service}` failed: {message}")]
    Introspection { service: String, message: String },

    #[error("response from service `{service}` has no content-type header")]
    ContentType { service: String },

    #[error("unexpected response from service `{service}`: {message}")]
    Protocol { service: String, message: String },

    #[error("request to service `{service}` failed: {message}")]
    Transport { service: String, message: String },

    #[error("request to service `{service}` timed out")]
    Timeout { service: String },

    #[error("client for `{origin}` is closed")]
    ClientClosed { origin: String },

    #[error("{0}")]
    InvalidQuery(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("authorization required")]
    Unauthenticated,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The `extensions.code` reported to GraphQL clients.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidQuery(_) => "GRAPHQL_VALIDATION_FAILED",
            GatewayError::Unsupported(_) => "UNSUPPORTED_OPERATION",
            GatewayError::Unauthenticated => "UNAUTHENTICATED",
            GatewayError::ContentType { .. }
            | GatewayError::Protocol { .. }
            | GatewayError::Transport { .. }
            | GatewayError::Timeout { .. }
            | GatewayError::ClientClosed { .. } => "DELEGATION_FAILED",
            GatewayError::Configuration(_)
            | GatewayError::Introspection { .. }
            | GatewayError::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Rewraps any per-service failure as an introspection failure, keeping
    /// the original message.
    pub(crate) fn into_introspection(self, service: &str) -> Self {
        match self {
            err @ GatewayError::Introspection { .. } => err,
            other => GatewayError::Introspection {
                service: service.to_string(),
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
