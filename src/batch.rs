use async_trait::async_trait;
use futures::future::join_all;
use graphql_parser::{
    Pos,
    query::{
        Definition, Directive, Field, OperationDefinition, Query, Selection, SelectionSet, Value,
    },
};
use serde_json::{Map, Value as JsonValue, json};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    Document,
    auth::RequestContext,
    error::{GatewayError, Result},
    remote_executor::{ExecutionRequest, Executor},
};

struct Pending {
    request: ExecutionRequest,
    reply: oneshot::Sender<Result<JsonValue>>,
}

type Queue = Arc<Mutex<Vec<Pending>>>;

/// Coalesces operations issued concurrently against one service into fewer
/// round-trips.
///
/// The first request to arrive on an empty queue schedules a flush for the
/// next scheduler turn; everything queued by then is dispatched together.
/// Compatible queries (same `Authorization`, plain root fields, no operation
/// directives) are merged into a single document with `_<n>_` prefixed
/// aliases, variables and fragments, and the reply is split back per caller.
pub struct BatchExecutor {
    service: String,
    inner: Arc<dyn Executor>,
    queue: Queue,
}

impl BatchExecutor {
    pub fn new(service: impl Into<String>, inner: Arc<dyn Executor>) -> Self {
        BatchExecutor {
            service: service.into(),
            inner,
            queue: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Executor for BatchExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<JsonValue> {
        let (reply, receiver) = oneshot::channel();
        let schedule = {
            let mut queue = lock(&self.queue);
            queue.push(Pending { request, reply });
            queue.len() == 1
        };

        if schedule {
            let queue = self.queue.clone();
            let inner = self.inner.clone();
            let service = self.service.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                let pending = std::mem::take(&mut *lock(&queue));
                dispatch(&service, inner, pending).await;
            });
        }

        receiver.await.map_err(|_| {
            GatewayError::Internal(format!(
                "batch for service `{}` was dropped before replying",
                self.service
            ))
        })?
    }
}

fn lock(queue: &Queue) -> MutexGuard<'_, Vec<Pending>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn dispatch(service: &str, inner: Arc<dyn Executor>, pending: Vec<Pending>) {
    let mut groups: Vec<(Option<String>, Vec<Pending>)> = Vec::new();
    let mut solo = Vec::new();

    for item in pending {
        if !is_mergeable(&item.request.document) {
            solo.push(item);
            continue;
        }
        let key = item.request.context.raw_authorization().map(str::to_string);
        match groups.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, group)) => group.push(item),
            None => groups.push((key, vec![item])),
        }
    }

    for (_, group) in &groups {
        if group.len() > 1 {
            debug!(service = %service, size = group.len(), "merging batched operations");
        }
    }

    let merged = groups
        .into_iter()
        .map(|(_, group)| execute_group(inner.clone(), group));
    let single = solo
        .into_iter()
        .map(|item| execute_group(inner.clone(), vec![item]));

    join_all(merged.chain(single)).await;
}

async fn execute_group(inner: Arc<dyn Executor>, mut group: Vec<Pending>) {
    if group.len() == 1 {
        if let Some(item) = group.pop() {
            let result = inner.execute(item.request).await;
            let _ = item.reply.send(result);
        }
        return;
    }

    let requests: Vec<&ExecutionRequest> = group.iter().map(|item| &item.request).collect();
    let merged = merge_requests(&requests);

    match inner.execute(merged).await {
        // Without `data` the errors cannot be attributed to one caller, so
        // each request is retried on its own.
        Ok(response) if !response.get("data").is_some_and(JsonValue::is_object) => {
            debug!(size = group.len(), "merged batch rejected, retrying individually");
            let retries = group.into_iter().map(|item| {
                let inner = inner.clone();
                async move {
                    let result = inner.execute(item.request).await;
                    let _ = item.reply.send(result);
                }
            });
            join_all(retries).await;
        }
        Ok(response) => {
            let parts = split_response(&response, group.len());
            for (item, part) in group.into_iter().zip(parts) {
                let _ = item.reply.send(Ok(part));
            }
        }
        Err(e) => {
            for item in group {
                let _ = item.reply.send(Err(e.clone()));
            }
        }
    }
}

/// A document can join a merged batch when it holds exactly one query
/// operation without directives whose root selections are all fields.
fn is_mergeable(document: &Document) -> bool {
    let mut operations = document.definitions.iter().filter_map(|d| match d {
        Definition::Operation(op) => Some(op),
        Definition::Fragment(_) => None,
    });

    let (Some(operation), None) = (operations.next(), operations.next()) else {
        return false;
    };

    let selection_set = match operation {
        OperationDefinition::SelectionSet(set) => set,
        OperationDefinition::Query(query) if query.directives.is_empty() => &query.selection_set,
        _ => return false,
    };

    selection_set
        .items
        .iter()
        .all(|item| matches!(item, Selection::Field(_)))
}

fn batch_prefix(index: usize) -> String {
    format!("_{}_", index)
}

/// Splits `_<n>_rest` into `(n, rest)`.
fn parse_prefixed(key: &str) -> Option<(usize, &str)> {
    let (index, rest) = key.strip_prefix('_')?.split_once('_')?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((index.parse().ok()?, rest))
}

fn merge_requests(requests: &[&ExecutionRequest]) -> ExecutionRequest {
    let mut variable_definitions = Vec::new();
    let mut items = Vec::new();
    let mut fragments = Vec::new();
    let mut variables = Map::new();

    for (index, request) in requests.iter().enumerate() {
        let prefix = batch_prefix(index);

        for definition in &request.document.definitions {
            match definition {
                Definition::Operation(operation) => {
                    let (definitions, selection_set) = match operation {
                        OperationDefinition::Query(query) => {
                            (query.variable_definitions.as_slice(), &query.selection_set)
                        }
                        OperationDefinition::SelectionSet(set) => (&[][..], set),
                        _ => continue,
                    };

                    for definition in definitions {
                        let mut definition = definition.clone();
                        definition.name = format!("{}{}", prefix, definition.name);
                        if let Some(default) = definition.default_value.as_mut() {
                            rename_value(default, &prefix);
                        }
                        variable_definitions.push(definition);
                    }

                    for item in &selection_set.items {
                        if let Selection::Field(field) = item {
                            let mut field = field.clone();
                            let key = field.alias.take().unwrap_or_else(|| field.name.clone());
                            field.alias = Some(format!("{}{}", prefix, key));
                            rename_field(&mut field, &prefix);
                            items.push(Selection::Field(field));
                        }
                    }
                }
                Definition::Fragment(fragment) => {
                    let mut fragment = fragment.clone();
                    fragment.name = format!("{}{}", prefix, fragment.name);
                    rename_directives(&mut fragment.directives, &prefix);
                    rename_selection_set(&mut fragment.selection_set, &prefix);
                    fragments.push(Definition::Fragment(fragment));
                }
            }
        }

        for (name, value) in &request.variables {
            variables.insert(format!("{}{}", prefix, name), value.clone());
        }
    }

    let operation = Query {
        position: Pos::default(),
        name: None,
        variable_definitions,
        directives: Vec::new(),
        selection_set: SelectionSet {
            span: (Pos::default(), Pos::default()),
            items,
        },
    };

    let mut definitions = vec![Definition::Operation(OperationDefinition::Query(operation))];
    definitions.extend(fragments);

    let deadline = requests.iter().filter_map(|r| r.context.deadline).min();
    let authorization = requests
        .first()
        .map(|r| r.context.authorization.clone())
        .unwrap_or_default();

    ExecutionRequest {
        document: Arc::new(Document { definitions }),
        variables,
        context: RequestContext {
            authorization,
            deadline,
        },
    }
}

fn rename_field(field: &mut Field<'static, String>, prefix: &str) {
    for (_, value) in &mut field.arguments {
        rename_value(value, prefix);
    }
    rename_directives(&mut field.directives, prefix);
    rename_selection_set(&mut field.selection_set, prefix);
}

fn rename_selection_set(set: &mut SelectionSet<'static, String>, prefix: &str) {
    for item in &mut set.items {
        match item {
            Selection::Field(field) => rename_field(field, prefix),
            Selection::FragmentSpread(spread) => {
                spread.fragment_name = format!("{}{}", prefix, spread.fragment_name);
                rename_directives(&mut spread.directives, prefix);
            }
            Selection::InlineFragment(inline) => {
                rename_directives(&mut inline.directives, prefix);
                rename_selection_set(&mut inline.selection_set, prefix);
            }
        }
    }
}

fn rename_directives(directives: &mut [Directive<'static, String>], prefix: &str) {
    for directive in directives {
        for (_, value) in &mut directive.arguments {
            rename_value(value, prefix);
        }
    }
}

fn rename_value(value: &mut Value<'static, String>, prefix: &str) {
    match value {
        Value::Variable(name) => *name = format!("{}{}", prefix, name),
        Value::List(values) => values.iter_mut().for_each(|v| rename_value(v, prefix)),
        Value::Object(fields) => fields.values_mut().for_each(|v| rename_value(v, prefix)),
        _ => {}
    }
}

/// Distributes a merged reply back over the `count` requests it was built
/// from.
fn split_response(response: &JsonValue, count: usize) -> Vec<JsonValue> {
    let mut data: Vec<Option<Map<String, JsonValue>>> = vec![None; count];
    let mut errors: Vec<Vec<JsonValue>> = vec![Vec::new(); count];

    if let Some(JsonValue::Object(merged)) = response.get("data") {
        for slot in data.iter_mut() {
            *slot = Some(Map::new());
        }
        for (key, value) in merged {
            if let Some((index, original)) = parse_prefixed(key) {
                if let Some(Some(part)) = data.get_mut(index) {
                    part.insert(original.to_string(), value.clone());
                }
            }
        }
    }

    if let Some(JsonValue::Array(merged_errors)) = response.get("errors") {
        for error in merged_errors {
            let routed = error
                .get("path")
                .and_then(JsonValue::as_array)
                .and_then(|path| path.first())
                .and_then(JsonValue::as_str)
                .and_then(parse_prefixed)
                .filter(|(index, _)| *index < count);

            match routed {
                Some((index, original)) => {
                    let mut error = error.clone();
                    error["path"][0] = JsonValue::String(original.to_string());
                    errors[index].push(error);
                }
                None => errors.iter_mut().for_each(|e| e.push(error.clone())),
            }
        }
    }

    data.into_iter()
        .zip(errors)
        .map(|(data, errors)| {
            let mut part = json!({ "data": data.map(JsonValue::Object).unwrap_or(JsonValue::Null) });
            if !errors.is_empty() {
                part["errors"] = JsonValue::Array(errors);
            }
            if let Some(extensions) = response.get("extensions") {
                part["extensions"] = extensions.clone();
            }
            part
        })
        .collect()
}
