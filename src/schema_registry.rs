use graphql_parser::schema::{Definition, ObjectType, TypeDefinition};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{info, warn};

use crate::{
    OperationKind, SchemaDocument,
    batch::BatchExecutor,
    config::{GatewayConfig, ServiceDescriptor, SubschemaConfig},
    error::Result,
    introspection::{RemoteSchema, introspect},
    registry::DelegationRegistry,
    remote_executor::{Executor, RemoteExecutor},
};

/// A backend's schema together with the executor that reaches it.
#[derive(Clone)]
pub struct Subschema {
    pub name: String,
    pub schema: RemoteSchema,
    pub executor: Arc<dyn Executor>,
    pub config: SubschemaConfig,
}

impl Subschema {
    pub fn batch(&self) -> bool {
        self.config.batch
    }
}

/// Introspects the service described by `descriptor` and wraps it in a
/// delegation-ready [`Subschema`].
///
/// The descriptor is validated before anything touches the network.
pub async fn resolve_subschema(
    descriptor: &ServiceDescriptor,
    registry: &Arc<DelegationRegistry>,
    config: &GatewayConfig,
) -> Result<Subschema> {
    let subschema_config = descriptor.subschema_config()?;
    let base_url = descriptor.base_url()?;
    let client = registry.clients.client_for(&base_url)?;

    let remote = Arc::new(RemoteExecutor::new(
        descriptor.name.clone(),
        client,
        registry.clone(),
        config.delegation.timeout(),
    ));

    let schema = introspect(
        &remote,
        config.startup.introspection_attempts,
        config.startup.retry_delay(),
    )
    .await?;

    let executor: Arc<dyn Executor> = if subschema_config.batch {
        Arc::new(BatchExecutor::new(descriptor.name.clone(), remote))
    } else {
        remote
    };

    info!(
        service = %descriptor.name,
        url = %base_url,
        batch = subschema_config.batch,
        query_fields = schema.root_fields(OperationKind::Query).len(),
        mutation_fields = schema.root_fields(OperationKind::Mutation).len(),
        "resolved remote schema"
    );

    Ok(Subschema {
        name: descriptor.name.clone(),
        schema,
        executor,
        config: subschema_config,
    })
}

/// The merged view over every subschema: which service owns each root
/// field, and the combined SDL.
pub struct StitchedSchema {
    subschemas: BTreeMap<String, Subschema>,
    root_owners: HashMap<(OperationKind, String), String>,
    document: SchemaDocument,
}

impl StitchedSchema {
    /// Merges subschemas in the order given. A root field declared by more
    /// than one service belongs to the first; other types are merged by
    /// name, first definition wins.
    pub fn stitch(subschemas: Vec<Subschema>) -> Self {
        let mut root_owners = HashMap::new();
        let mut query = ObjectType::new(OperationKind::Query.default_root_type().to_string());
        let mut mutation = ObjectType::new(OperationKind::Mutation.default_root_type().to_string());
        let mut types: Vec<(String, TypeDefinition<'static, String>)> = Vec::new();
        let mut type_index: HashMap<String, usize> = HashMap::new();

        for subschema in &subschemas {
            let query_root = subschema.schema.root_type_name(OperationKind::Query);
            let mutation_root = subschema.schema.root_type_name(OperationKind::Mutation);

            for definition in subschema.schema.type_definitions() {
                let name = type_name(definition);

                let root = match definition {
                    TypeDefinition::Object(object) if Some(name) == query_root => {
                        Some((OperationKind::Query, object, &mut query))
                    }
                    TypeDefinition::Object(object) if Some(name) == mutation_root => {
                        Some((OperationKind::Mutation, object, &mut mutation))
                    }
                    _ => None,
                };

                if let Some((kind, object, merged)) = root {
                    for field in &object.fields {
                        let key = (kind, field.name.clone());
                        if let Some(owner) = root_owners.get(&key) {
                            warn!(
                                field = %field.name,
                                owner = %owner,
                                ignored = %subschema.name,
                                "root field declared by more than one service"
                            );
                            continue;
                        }
                        root_owners.insert(key, subschema.name.clone());
                        merged.fields.push(field.clone());
                    }
                    continue;
                }

                match type_index.get(name) {
                    Some(&index) => {
                        if types[index].1 != *definition {
                            warn!(
                                type_name = %name,
                                kept = %types[index].0,
                                ignored = %subschema.name,
                                "type defined differently by two services"
                            );
                        }
                    }
                    None => {
                        type_index.insert(name.to_string(), types.len());
                        types.push((subschema.name.clone(), definition.clone()));
                    }
                }
            }
        }

        let mut definitions = vec![Definition::TypeDefinition(TypeDefinition::Object(query))];
        if !mutation.fields.is_empty() {
            definitions.push(Definition::TypeDefinition(TypeDefinition::Object(
                mutation,
            )));
        }
        definitions.extend(
            types
                .into_iter()
                .map(|(_, definition)| Definition::TypeDefinition(definition)),
        );

        StitchedSchema {
            subschemas: subschemas
                .into_iter()
                .map(|subschema| (subschema.name.clone(), subschema))
                .collect(),
            root_owners,
            document: SchemaDocument { definitions },
        }
    }

    pub fn owner_of(&self, kind: OperationKind, field: &str) -> Option<&str> {
        self.root_owners
            .get(&(kind, field.to_string()))
            .map(String::as_str)
    }

    pub fn subschema(&self, name: &str) -> Option<&Subschema> {
        self.subschemas.get(name)
    }

    pub fn subschemas(&self) -> impl Iterator<Item = &Subschema> {
        self.subschemas.values()
    }

    pub fn root_type_name(&self, kind: OperationKind) -> &'static str {
        kind.default_root_type()
    }

    pub fn sdl(&self) -> String {
        self.document.to_string()
    }
}

fn type_name<'a>(definition: &'a TypeDefinition<'static, String>) -> &'a str {
    match definition {
        TypeDefinition::Scalar(t) => &t.name,
        TypeDefinition::Object(t) => &t.name,
        TypeDefinition::Interface(t) => &t.name,
        TypeDefinition::Union(t) => &t.name,
        TypeDefinition::Enum(t) => &t.name,
        TypeDefinition::InputObject(t) => &t.name,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        error::GatewayError, introspection::tests::introspection_data,
        remote_executor::ExecutionRequest,
    };
    use async_trait::async_trait;
    use serde_json::{Value, json};

    pub(crate) struct Unreachable;

    #[async_trait]
    impl Executor for Unreachable {
        async fn execute(&self, _request: ExecutionRequest) -> Result<Value> {
            Err(GatewayError::Internal("not reachable in this test".to_string()))
        }
    }

    pub(crate) fn subschema_with(
        name: &str,
        fields: &[&str],
        mutations: &[&str],
        executor: Arc<dyn Executor>,
    ) -> Subschema {
        Subschema {
            name: name.to_string(),
            schema: RemoteSchema::from_introspection(&introspection_data(fields, mutations))
                .unwrap(),
            executor,
            config: SubschemaConfig::resolve(name, None).unwrap(),
        }
    }

    #[test]
    fn root_fields_are_owned_by_their_service() {
        let stitched = StitchedSchema::stitch(vec![
            subschema_with("actions", &["actions", "action"], &["createAction"], Arc::new(Unreachable)),
            subschema_with("users", &["users", "me"], &[], Arc::new(Unreachable)),
        ]);

        assert_eq!(stitched.owner_of(OperationKind::Query, "actions"), Some("actions"));
        assert_eq!(stitched.owner_of(OperationKind::Query, "me"), Some("users"));
        assert_eq!(
            stitched.owner_of(OperationKind::Mutation, "createAction"),
            Some("actions")
        );
        assert_eq!(stitched.owner_of(OperationKind::Query, "createAction"), None);
        assert_eq!(stitched.subschemas().count(), 2);
    }

    #[test]
    fn first_service_wins_a_root_field_conflict() {
        let stitched = StitchedSchema::stitch(vec![
            subschema_with("a", &["hello"], &[], Arc::new(Unreachable)),
            subschema_with("b", &["hello", "other"], &[], Arc::new(Unreachable)),
        ]);

        assert_eq!(stitched.owner_of(OperationKind::Query, "hello"), Some("a"));
        assert_eq!(stitched.owner_of(OperationKind::Query, "other"), Some("b"));
        assert_eq!(stitched.sdl().matches("hello(").count(), 1);
    }

    #[test]
    fn merged_sdl_contains_every_root_field() {
        let stitched = StitchedSchema::stitch(vec![
            subschema_with("a", &["helloA"], &["renameA"], Arc::new(Unreachable)),
            subschema_with("b", &["helloB"], &[], Arc::new(Unreachable)),
        ]);
        let sdl = stitched.sdl();

        assert!(sdl.contains("type Query"));
        assert!(sdl.contains("helloA(name: String = \"World\"): String"));
        assert!(sdl.contains("helloB"));
        assert!(sdl.contains("type Mutation"));
        assert!(sdl.contains("renameA"));
    }

    #[tokio::test]
    async fn descriptor_without_location_fails_before_network() {
        let registry = DelegationRegistry::new(10);
        let descriptor = ServiceDescriptor {
            name: "orphan".to_string(),
            href: None,
            port: None,
            config: None,
        };

        let err = resolve_subschema(&descriptor, &registry, &GatewayConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::Configuration(_)));
        assert!(registry.clients.is_empty());
    }

    #[tokio::test]
    async fn resolved_subschema_honors_batch_override() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/graphql")
            .with_header("content-type", "application/json")
            .with_body(json!({ "data": introspection_data(&["projects"], &[]) }).to_string())
            .create_async()
            .await;

        let registry = DelegationRegistry::new(10);
        let mut descriptor = ServiceDescriptor::with_href("projects", server.url());
        descriptor.config = Some(json!({ "batch": false, "label": "p" }));

        let subschema = resolve_subschema(&descriptor, &registry, &GatewayConfig::default())
            .await
            .unwrap();
        assert!(!subschema.batch());
        assert_eq!(subschema.config.extra["label"], "p");
        assert_eq!(
            subschema.schema.root_fields(OperationKind::Query),
            vec!["projects"]
        );
        assert_eq!(registry.clients.len(), 1);
    }
}
