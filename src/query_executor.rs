use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{
    OperationKind,
    auth::RequestContext,
    error::{GatewayError, Result},
    query_planner::{PlanStep, QueryPlan},
    remote_executor::ExecutionRequest,
    schema_registry::StitchedSchema,
};

#[async_trait]
pub trait QueryExecutor {
    /// Runs every step of `plan` and merges the results into one GraphQL
    /// response envelope. Delegation failures are reported inside the
    /// envelope, never as an `Err`.
    async fn execute_plan(
        &self,
        plan: &QueryPlan,
        schema: &StitchedSchema,
        variables: &Map<String, Value>,
        context: &RequestContext,
    ) -> Value;
}

/// Executes plan steps through each subschema's own executor.
#[derive(Default)]
pub struct DelegatingQueryExecutor;

impl DelegatingQueryExecutor {
    pub fn new() -> Self {
        DelegatingQueryExecutor
    }
}

#[async_trait]
impl QueryExecutor for DelegatingQueryExecutor {
    async fn execute_plan(
        &self,
        plan: &QueryPlan,
        schema: &StitchedSchema,
        variables: &Map<String, Value>,
        context: &RequestContext,
    ) -> Value {
        let outcomes = match plan.kind {
            OperationKind::Query => {
                join_all(
                    plan.steps
                        .iter()
                        .map(|step| run_step(step, schema, variables, context)),
                )
                .await
            }
            OperationKind::Mutation => {
                let mut outcomes = Vec::with_capacity(plan.steps.len());
                for step in &plan.steps {
                    outcomes.push(run_step(step, schema, variables, context).await);
                }
                outcomes
            }
        };

        let mut fields = Map::new();
        let mut errors = Vec::new();

        for (step, outcome) in plan.steps.iter().zip(outcomes) {
            match outcome {
                Ok(response) => merge_response(step, response, &mut fields, &mut errors),
                Err(err) => {
                    warn!(service = %step.service, error = %err, "delegation failed");
                    for key in &step.response_keys {
                        fields.insert(key.clone(), Value::Null);
                        errors.push(json!({
                            "message": err.to_string(),
                            "path": [key],
                            "extensions": {
                                "code": "DELEGATION_FAILED",
                                "service": step.service,
                            },
                        }));
                    }
                }
            }
        }

        for local in &plan.typename_keys {
            if local.is_included(variables) {
                fields.insert(local.key.clone(), json!(schema.root_type_name(plan.kind)));
            }
        }

        // Keep the order the operation asked for.
        let mut data = Map::new();
        for key in &plan.response_keys {
            if let Some(value) = fields.remove(key) {
                data.insert(key.clone(), value);
            }
        }

        let mut response = Map::new();
        response.insert("data".to_string(), Value::Object(data));
        if !errors.is_empty() {
            response.insert("errors".to_string(), Value::Array(errors));
        }
        Value::Object(response)
    }
}

async fn run_step(
    step: &PlanStep,
    schema: &StitchedSchema,
    variables: &Map<String, Value>,
    context: &RequestContext,
) -> Result<Value> {
    let subschema = schema.subschema(&step.service).ok_or_else(|| {
        GatewayError::Internal(format!("no subschema named `{}`", step.service))
    })?;

    debug!(service = %step.service, fields = ?step.response_keys, "delegating");

    subschema
        .executor
        .execute(ExecutionRequest {
            document: step.document.clone(),
            variables: step.select_variables(variables),
            context: context.clone(),
        })
        .await
}

fn merge_response(
    step: &PlanStep,
    response: Value,
    fields: &mut Map<String, Value>,
    errors: &mut Vec<Value>,
) {
    let Value::Object(mut response) = response else {
        for key in &step.response_keys {
            fields.insert(key.clone(), Value::Null);
        }
        return;
    };

    match response.remove("data") {
        Some(Value::Object(data)) => fields.extend(data),
        // `data: null` nulls every field the step was responsible for.
        _ => {
            for key in &step.response_keys {
                fields.insert(key.clone(), Value::Null);
            }
        }
    }

    if let Some(Value::Array(list)) = response.remove("errors") {
        errors.extend(list);
    }
}
