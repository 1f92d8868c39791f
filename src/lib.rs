pub mod auth;
pub mod batch;
pub mod client_pool;
pub mod config;
pub mod error;
pub mod federation_gateway;
pub mod introspection;
pub mod print_cache;
pub mod query_executor;
pub mod query_planner;
pub mod registry;
pub mod remote_executor;
pub mod schema_registry;
pub mod server;

pub use auth::{AuthorizationContext, IdentityResolver, RequestContext};
pub use config::{GatewayConfig, ServiceDescriptor, ServiceEntry};
pub use error::{GatewayError, Result};
pub use federation_gateway::FederationGateway;
pub use query_planner::RootFieldPlanner;
pub use remote_executor::{ExecutionRequest, Executor, RemoteExecutor};
pub use schema_registry::{StitchedSchema, Subschema};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A parsed operation document that owns all of its text.
pub type Document = graphql_parser::query::Document<'static, String>;

/// A schema document that owns all of its text.
pub type SchemaDocument = graphql_parser::schema::Document<'static, String>;

pub fn parse_document(query: &str) -> Result<Document> {
    graphql_parser::parse_query::<String>(query)
        .map(|document| document.into_static())
        .map_err(|e| GatewayError::InvalidQuery(format!("Failed to parse query: {}", e)))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Query,
    Mutation,
}

impl OperationKind {
    pub fn default_root_type(self) -> &'static str {
        match self {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default, rename = "operationName")]
    pub operation_name: Option<String>,
}
