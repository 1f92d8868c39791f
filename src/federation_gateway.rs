use futures::future::try_join_all;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::{
    GraphQLRequest,
    auth::{AuthorizationContext, IdentityResolver, RequestContext},
    client_pool::ShutdownReport,
    config::GatewayConfig,
    error::{GatewayError, Result},
    query_executor::{DelegatingQueryExecutor, QueryExecutor},
    query_planner::{QueryPlanner, RootFieldPlanner},
    registry::DelegationRegistry,
    schema_registry::{StitchedSchema, resolve_subschema},
};

pub struct FederationGateway {
    config: GatewayConfig,
    registry: Arc<DelegationRegistry>,
    schema: StitchedSchema,
    query_planner: Box<dyn QueryPlanner + Send + Sync>,
    query_executor: Box<dyn QueryExecutor + Send + Sync>,
    identity_resolver: Arc<dyn IdentityResolver>,
}

impl FederationGateway {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<DelegationRegistry>,
        schema: StitchedSchema,
        query_planner: Box<dyn QueryPlanner + Send + Sync>,
        query_executor: Box<dyn QueryExecutor + Send + Sync>,
        identity_resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        FederationGateway {
            config,
            registry,
            schema,
            query_planner,
            query_executor,
            identity_resolver,
        }
    }

    /// Validates every service declaration, introspects all services
    /// concurrently and stitches the result.
    ///
    /// Nothing is sent over the network unless every declaration is valid.
    /// If any introspection fails the clients opened so far are closed
    /// before the error is returned.
    pub async fn start(
        config: GatewayConfig,
        identity_resolver: Arc<dyn IdentityResolver>,
    ) -> Result<Self> {
        let descriptors = config.descriptors();
        if descriptors.is_empty() {
            return Err(GatewayError::Configuration(
                "no services declared".to_string(),
            ));
        }
        for descriptor in &descriptors {
            descriptor.base_url()?;
            descriptor.subschema_config()?;
        }

        let registry = DelegationRegistry::new(config.pipelining_depth);
        let resolved = try_join_all(
            descriptors
                .iter()
                .map(|descriptor| resolve_subschema(descriptor, &registry, &config)),
        )
        .await;

        let subschemas = match resolved {
            Ok(subschemas) => subschemas,
            Err(err) => {
                error!(error = %err, "gateway startup failed");
                registry.shutdown().await;
                return Err(err);
            }
        };

        let schema = StitchedSchema::stitch(subschemas);
        info!(
            services = descriptors.len(),
            "gateway schema stitched"
        );

        let query_planner = Box::new(RootFieldPlanner::new(config.plan_cache_size));
        Ok(FederationGateway::new(
            config,
            registry,
            schema,
            query_planner,
            Box::new(DelegatingQueryExecutor::new()),
            identity_resolver,
        ))
    }

    /// Builds the authorization context for one inbound request.
    pub async fn authorize(&self, header: Option<String>) -> Result<AuthorizationContext> {
        let context = AuthorizationContext::resolve(header, self.identity_resolver.as_ref()).await?;
        if self.config.auth.require_token && context.bearer_token.is_none() {
            return Err(GatewayError::Unauthenticated);
        }
        Ok(context)
    }

    pub async fn process_request(
        &self,
        request: GraphQLRequest,
        authorization: AuthorizationContext,
    ) -> Value {
        debug!(operation = ?request.operation_name, "processing request");

        if self.config.auth.require_token && authorization.bearer_token.is_none() {
            return error_response(&GatewayError::Unauthenticated);
        }

        let variables = match request.variables.clone() {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(variables)) => variables,
            Some(_) => {
                return error_response(&GatewayError::InvalidQuery(
                    "Variables must be provided as an object".to_string(),
                ));
            }
        };

        let query_plan = match self.query_planner.plan_query(&request, &self.schema).await {
            Ok(plan) => plan,
            Err(err) => {
                debug!(error = %err, "query rejected");
                return error_response(&err);
            }
        };

        let deadline = self
            .config
            .delegation
            .request_timeout()
            .map(|timeout| Instant::now() + timeout);
        let context = RequestContext::new(authorization).with_deadline(deadline);

        self.query_executor
            .execute_plan(&query_plan, &self.schema, &variables, &context)
            .await
    }

    pub fn schema(&self) -> &StitchedSchema {
        &self.schema
    }

    pub fn sdl(&self) -> String {
        self.schema.sdl()
    }

    pub fn registry(&self) -> &Arc<DelegationRegistry> {
        &self.registry
    }

    /// Closes every pooled client. Failures are logged, never returned.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.registry.shutdown().await
    }
}

/// A GraphQL envelope carrying a single request-level error.
pub fn error_response(err: &GatewayError) -> Value {
    json!({
        "errors": [{
            "message": err.to_string(),
            "extensions": { "code": err.code() },
        }]
    })
}
