#![allow(dead_code)]

use bytes::Bytes;
use graphql_parser::query::{Definition, OperationDefinition, Selection, Value as AstValue};
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, body::Incoming, service::service_fn};
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::{Map, Value, json};
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use switchyard::{GatewayConfig, ServiceEntry};
use tokio::{net::TcpListener, sync::oneshot};

/// What a fake service saw for one delegated (non-introspection) call.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub query: String,
    pub variables: Map<String, Value>,
    pub authorization: Option<String>,
}

/// Shared across every fake service of a test, so mutation order can be
/// observed across services.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub struct ServiceState {
    pub name: String,
    query_fields: Vec<String>,
    mutation_fields: Vec<String>,
    pub delay: Mutex<Duration>,
    pub failing: AtomicBool,
    pub omit_content_type: AtomicBool,
    pub round_trips: AtomicUsize,
    pub introspections: AtomicUsize,
    pub requests: Mutex<Vec<Recorded>>,
    pub log: CallLog,
}

/// A small GraphQL service that answers introspection and resolves every
/// root field to `Hello <name>!`.
pub struct FakeService {
    pub addr: SocketAddr,
    pub state: Arc<ServiceState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl FakeService {
    pub async fn start(name: &str, query_fields: &[&str], mutation_fields: &[&str]) -> Self {
        Self::start_with_log(name, query_fields, mutation_fields, CallLog::default()).await
    }

    pub async fn start_with_log(
        name: &str,
        query_fields: &[&str],
        mutation_fields: &[&str],
        log: CallLog,
    ) -> Self {
        let state = Arc::new(ServiceState {
            name: name.to_string(),
            query_fields: query_fields.iter().map(|f| f.to_string()).collect(),
            mutation_fields: mutation_fields.iter().map(|f| f.to_string()).collect(),
            delay: Mutex::new(Duration::ZERO),
            failing: AtomicBool::new(false),
            omit_content_type: AtomicBool::new(false),
            round_trips: AtomicUsize::new(0),
            introspections: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            log,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, mut stopped) = oneshot::channel::<()>();

        let served = state.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = tokio::select! {
                    accepted = listener.accept() => accepted.unwrap(),
                    _ = &mut stopped => break,
                };
                let state = served.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| answer(req, state.clone()));
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        FakeService {
            addr,
            state,
            shutdown: Some(shutdown),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn entry(&self) -> ServiceEntry {
        ServiceEntry {
            href: Some(self.url()),
            port: None,
            config: None,
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_omit_content_type(&self, omit: bool) {
        self.state.omit_content_type.store(omit, Ordering::SeqCst);
    }

    pub fn round_trips(&self) -> usize {
        self.state.round_trips.load(Ordering::SeqCst)
    }

    pub fn introspections(&self) -> usize {
        self.state.introspections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }
}

impl Drop for FakeService {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub fn config_for(services: &[&FakeService]) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    for service in services {
        config.add_service(service.state.name.clone(), service.entry());
    }
    config
}

async fn answer(
    req: Request<Incoming>,
    state: Arc<ServiceState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let authorization = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = req.collect().await.map(|b| b.to_bytes()).unwrap_or_default();
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let query = payload["query"].as_str().unwrap_or_default().to_string();
    let variables = payload["variables"].as_object().cloned().unwrap_or_default();

    if query.contains("__schema") {
        state.introspections.fetch_add(1, Ordering::SeqCst);
        let data = introspection(&state.query_fields, &state.mutation_fields);
        return Ok(json_reply(&json!({ "data": data })));
    }

    state.round_trips.fetch_add(1, Ordering::SeqCst);
    state.requests.lock().unwrap().push(Recorded {
        query: query.clone(),
        variables: variables.clone(),
        authorization,
    });

    let delay = *state.delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    if state.failing.load(Ordering::SeqCst) {
        let mut response = Response::new(Full::new(Bytes::from("backend exploded")));
        *response.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
        response
            .headers_mut()
            .insert("content-type", "text/plain".parse().unwrap());
        return Ok(response);
    }

    let mut response = json_reply(&resolve(&state, &query, &variables));
    if state.omit_content_type.load(Ordering::SeqCst) {
        response.headers_mut().remove("content-type");
    }
    Ok(response)
}

fn json_reply(body: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    response
        .headers_mut()
        .insert("content-type", "application/json; charset=utf-8".parse().unwrap());
    response
}

fn resolve(state: &ServiceState, query: &str, variables: &Map<String, Value>) -> Value {
    let document = match graphql_parser::parse_query::<String>(query) {
        Ok(document) => document,
        Err(e) => return json!({ "errors": [{ "message": e.to_string() }] }),
    };

    let Some((is_mutation, items)) = document.definitions.iter().find_map(|d| match d {
        Definition::Operation(OperationDefinition::SelectionSet(set)) => Some((false, &set.items)),
        Definition::Operation(OperationDefinition::Query(q)) => Some((false, &q.selection_set.items)),
        Definition::Operation(OperationDefinition::Mutation(m)) => {
            Some((true, &m.selection_set.items))
        }
        _ => None,
    }) else {
        return json!({ "errors": [{ "message": "no operation" }] });
    };

    let mut data = Map::new();
    resolve_items(state, is_mutation, items, variables, &mut data);
    json!({ "data": data })
}

fn resolve_items(
    state: &ServiceState,
    is_mutation: bool,
    items: &[Selection<'_, String>],
    variables: &Map<String, Value>,
    data: &mut Map<String, Value>,
) {
    for item in items {
        match item {
            Selection::Field(field) => {
                let key = field.alias.clone().unwrap_or_else(|| field.name.clone());
                if field.name == "__typename" {
                    data.insert(key, json!(if is_mutation { "Mutation" } else { "Query" }));
                    continue;
                }
                if is_mutation {
                    state
                        .log
                        .lock()
                        .unwrap()
                        .push(format!("{}:{}", state.name, field.name));
                }
                let name = field
                    .arguments
                    .iter()
                    .find(|(arg, _)| arg == "name")
                    .and_then(|(_, value)| match value {
                        AstValue::String(s) => Some(s.clone()),
                        AstValue::Variable(v) => {
                            variables.get(v).and_then(Value::as_str).map(str::to_string)
                        }
                        _ => None,
                    })
                    .unwrap_or_else(|| "World".to_string());
                data.insert(key, json!(format!("Hello {}!", name)));
            }
            Selection::InlineFragment(fragment) => {
                if included(&fragment.directives, variables) {
                    resolve_items(state, is_mutation, &fragment.selection_set.items, variables, data);
                }
            }
            Selection::FragmentSpread(_) => {}
        }
    }
}

fn included(
    directives: &[graphql_parser::query::Directive<'_, String>],
    variables: &Map<String, Value>,
) -> bool {
    directives.iter().all(|directive| {
        let condition = directive
            .arguments
            .iter()
            .find(|(arg, _)| arg == "if")
            .map(|(_, value)| match value {
                AstValue::Boolean(b) => *b,
                AstValue::Variable(v) => variables.get(v).and_then(Value::as_bool).unwrap_or(false),
                _ => false,
            })
            .unwrap_or(true);
        match directive.name.as_str() {
            "include" => condition,
            "skip" => !condition,
            _ => true,
        }
    })
}

pub fn introspection(fields: &[String], mutations: &[String]) -> Value {
    let string = json!({ "kind": "SCALAR", "name": "String", "ofType": null });
    let field = |name: &String| {
        json!({
            "name": name,
            "description": null,
            "args": [{
                "name": "name",
                "description": null,
                "type": string,
                "defaultValue": "\"World\""
            }],
            "type": string,
            "isDeprecated": false,
            "deprecationReason": null
        })
    };
    let object = |name: &str, fields: &[String]| {
        json!({
            "kind": "OBJECT",
            "name": name,
            "description": null,
            "fields": fields.iter().map(|f| field(f)).collect::<Vec<_>>(),
            "inputFields": null,
            "interfaces": [],
            "enumValues": null,
            "possibleTypes": null
        })
    };

    let mut types = vec![
        object("Query", fields),
        json!({ "kind": "SCALAR", "name": "String", "description": null }),
    ];
    let mutation_type = if mutations.is_empty() {
        Value::Null
    } else {
        types.push(object("Mutation", mutations));
        json!({ "name": "Mutation" })
    };

    json!({
        "__schema": {
            "queryType": { "name": "Query" },
            "mutationType": mutation_type,
            "subscriptionType": null,
            "types": types
        }
    })
}
