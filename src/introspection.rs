use graphql_parser::{
    Pos,
    query::{Definition as QueryDefinition, OperationDefinition, Selection},
    schema::{
        Definition, Directive, EnumType, EnumValue, Field, InputObjectType, InputValue,
        InterfaceType, ObjectType, ScalarType, SchemaDefinition, Type, TypeDefinition, UnionType,
        Value,
    },
};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    OperationKind, SchemaDocument,
    auth::RequestContext,
    error::{GatewayError, Result},
    parse_document,
    remote_executor::{ExecutionRequest, RemoteExecutor},
};

pub const INTROSPECTION_QUERY: &str = r#"
query IntrospectionQuery {
  __schema {
    queryType { name }
    mutationType { name }
    subscriptionType { name }
    types { ...FullType }
  }
}

fragment FullType on __Type {
  kind
  name
  description
  fields(includeDeprecated: true) {
    name
    description
    args { ...InputValue }
    type { ...TypeRef }
    isDeprecated
    deprecationReason
  }
  inputFields { ...InputValue }
  interfaces { ...TypeRef }
  enumValues(includeDeprecated: true) {
    name
    description
    isDeprecated
    deprecationReason
  }
  possibleTypes { ...TypeRef }
}

fragment InputValue on __InputValue {
  name
  description
  type { ...TypeRef }
  defaultValue
}

fragment TypeRef on __Type {
  kind
  name
  ofType {
    kind
    name
    ofType {
      kind
      name
      ofType {
        kind
        name
        ofType {
          kind
          name
          ofType {
            kind
            name
            ofType {
              kind
              name
              ofType {
                kind
                name
              }
            }
          }
        }
      }
    }
  }
}
"#;

const BUILT_IN_SCALARS: [&str; 5] = ["String", "Int", "Float", "Boolean", "ID"];

#[derive(Debug, Deserialize)]
struct IntrospectionData {
    #[serde(rename = "__schema")]
    schema: IntrospectionSchema,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrospectionSchema {
    query_type: Option<NamedRef>,
    mutation_type: Option<NamedRef>,
    subscription_type: Option<NamedRef>,
    types: Vec<FullType>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum TypeKind {
    Scalar,
    Object,
    Interface,
    Union,
    Enum,
    InputObject,
    List,
    NonNull,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FullType {
    kind: TypeKind,
    name: String,
    description: Option<String>,
    fields: Option<Vec<FieldDef>>,
    input_fields: Option<Vec<InputValueDef>>,
    interfaces: Option<Vec<TypeRef>>,
    enum_values: Option<Vec<EnumValueDef>>,
    possible_types: Option<Vec<TypeRef>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldDef {
    name: String,
    description: Option<String>,
    #[serde(default)]
    args: Vec<InputValueDef>,
    #[serde(rename = "type")]
    field_type: TypeRef,
    #[serde(default)]
    is_deprecated: bool,
    deprecation_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputValueDef {
    name: String,
    description: Option<String>,
    #[serde(rename = "type")]
    value_type: TypeRef,
    default_value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnumValueDef {
    name: String,
    description: Option<String>,
    #[serde(default)]
    is_deprecated: bool,
    deprecation_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeRef {
    kind: TypeKind,
    name: Option<String>,
    of_type: Option<Box<TypeRef>>,
}

/// The type system of one backend, rebuilt from its introspection result.
#[derive(Debug, Clone)]
pub struct RemoteSchema {
    pub query_type: Option<String>,
    pub mutation_type: Option<String>,
    pub document: SchemaDocument,
}

impl RemoteSchema {
    /// Builds the schema from the `data` object of an introspection reply.
    pub fn from_introspection(data: &JsonValue) -> std::result::Result<Self, String> {
        let data = IntrospectionData::deserialize(data)
            .map_err(|e| format!("malformed introspection result: {}", e))?;
        let schema = data.schema;

        let mut definitions = Vec::new();
        let query_type = schema.query_type.map(|r| r.name);
        let mutation_type = schema.mutation_type.map(|r| r.name);
        let subscription_type = schema.subscription_type.map(|r| r.name);

        let default_roots = query_type.as_deref().is_none_or(|name| name == "Query")
            && mutation_type.as_deref().is_none_or(|name| name == "Mutation")
            && subscription_type.is_none();
        if !default_roots {
            definitions.push(Definition::SchemaDefinition(SchemaDefinition {
                position: Pos::default(),
                directives: Vec::new(),
                query: query_type.clone(),
                mutation: mutation_type.clone(),
                subscription: subscription_type,
            }));
        }

        for full_type in schema.types {
            if full_type.name.starts_with("__") {
                continue;
            }
            if let Some(definition) = convert_type(full_type)? {
                definitions.push(Definition::TypeDefinition(definition));
            }
        }

        Ok(RemoteSchema {
            query_type,
            mutation_type,
            document: SchemaDocument { definitions },
        })
    }

    pub fn root_type_name(&self, kind: OperationKind) -> Option<&str> {
        match kind {
            OperationKind::Query => self.query_type.as_deref(),
            OperationKind::Mutation => self.mutation_type.as_deref(),
        }
    }

    /// Names of the fields on the root type for `kind`, in declaration order.
    pub fn root_fields(&self, kind: OperationKind) -> Vec<&str> {
        let Some(root) = self.root_type_name(kind) else {
            return Vec::new();
        };
        self.type_definitions()
            .find_map(|definition| match definition {
                TypeDefinition::Object(object) if object.name == root => {
                    Some(object.fields.iter().map(|f| f.name.as_str()).collect())
                }
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn type_definitions(&self) -> impl Iterator<Item = &TypeDefinition<'static, String>> {
        self.document
            .definitions
            .iter()
            .filter_map(|definition| match definition {
                Definition::TypeDefinition(definition) => Some(definition),
                _ => None,
            })
    }

    pub fn sdl(&self) -> String {
        self.document.to_string()
    }
}

fn convert_type(
    full_type: FullType,
) -> std::result::Result<Option<TypeDefinition<'static, String>>, String> {
    let definition = match full_type.kind {
        TypeKind::Scalar => {
            if BUILT_IN_SCALARS.contains(&full_type.name.as_str()) {
                return Ok(None);
            }
            let mut scalar = ScalarType::new(full_type.name);
            scalar.description = full_type.description;
            TypeDefinition::Scalar(scalar)
        }
        TypeKind::Object => {
            let mut object = ObjectType::new(full_type.name);
            object.description = full_type.description;
            object.implements_interfaces = named_refs(full_type.interfaces)?;
            object.fields = convert_fields(full_type.fields)?;
            TypeDefinition::Object(object)
        }
        TypeKind::Interface => {
            let mut interface = InterfaceType::new(full_type.name);
            interface.description = full_type.description;
            interface.fields = convert_fields(full_type.fields)?;
            TypeDefinition::Interface(interface)
        }
        TypeKind::Union => {
            let mut union = UnionType::new(full_type.name);
            union.description = full_type.description;
            union.types = named_refs(full_type.possible_types)?;
            TypeDefinition::Union(union)
        }
        TypeKind::Enum => {
            let mut enumeration = EnumType::new(full_type.name);
            enumeration.description = full_type.description;
            enumeration.values = full_type
                .enum_values
                .unwrap_or_default()
                .into_iter()
                .map(|value| {
                    let mut converted = EnumValue::new(value.name);
                    converted.description = value.description;
                    converted.directives =
                        deprecation(value.is_deprecated, value.deprecation_reason);
                    converted
                })
                .collect();
            TypeDefinition::Enum(enumeration)
        }
        TypeKind::InputObject => {
            let mut input = InputObjectType::new(full_type.name);
            input.description = full_type.description;
            input.fields = convert_input_values(full_type.input_fields.unwrap_or_default())?;
            TypeDefinition::InputObject(input)
        }
        TypeKind::List | TypeKind::NonNull => {
            return Err(format!(
                "wrapper kind {:?} listed as named type `{}`",
                full_type.kind, full_type.name
            ));
        }
    };
    Ok(Some(definition))
}

fn convert_fields(
    fields: Option<Vec<FieldDef>>,
) -> std::result::Result<Vec<Field<'static, String>>, String> {
    fields
        .unwrap_or_default()
        .into_iter()
        .map(|field| {
            Ok(Field {
                position: Pos::default(),
                description: field.description,
                name: field.name,
                arguments: convert_input_values(field.args)?,
                field_type: convert_type_ref(&field.field_type)?,
                directives: deprecation(field.is_deprecated, field.deprecation_reason),
            })
        })
        .collect()
}

fn convert_input_values(
    values: Vec<InputValueDef>,
) -> std::result::Result<Vec<InputValue<'static, String>>, String> {
    values
        .into_iter()
        .map(|value| {
            let default_value = match value.default_value.as_deref() {
                Some(literal) => Some(parse_value_literal(literal).ok_or_else(|| {
                    format!(
                        "invalid default value `{}` for `{}`",
                        literal, value.name
                    )
                })?),
                None => None,
            };
            Ok(InputValue {
                position: Pos::default(),
                description: value.description,
                name: value.name,
                value_type: convert_type_ref(&value.value_type)?,
                default_value,
                directives: Vec::new(),
            })
        })
        .collect()
}

fn convert_type_ref(type_ref: &TypeRef) -> std::result::Result<Type<'static, String>, String> {
    match type_ref.kind {
        TypeKind::NonNull | TypeKind::List => {
            let inner = type_ref
                .of_type
                .as_deref()
                .ok_or_else(|| "wrapper type without ofType".to_string())?;
            let inner = Box::new(convert_type_ref(inner)?);
            Ok(if type_ref.kind == TypeKind::NonNull {
                Type::NonNullType(inner)
            } else {
                Type::ListType(inner)
            })
        }
        _ => type_ref
            .name
            .clone()
            .map(Type::NamedType)
            .ok_or_else(|| "named type reference without a name".to_string()),
    }
}

fn named_refs(refs: Option<Vec<TypeRef>>) -> std::result::Result<Vec<String>, String> {
    refs.unwrap_or_default()
        .into_iter()
        .map(|r| r.name.ok_or_else(|| "type reference without a name".to_string()))
        .collect()
}

fn deprecation(is_deprecated: bool, reason: Option<String>) -> Vec<Directive<'static, String>> {
    if !is_deprecated {
        return Vec::new();
    }
    let arguments = reason
        .map(|reason| vec![("reason".to_string(), Value::String(reason))])
        .unwrap_or_default();
    vec![Directive {
        position: Pos::default(),
        name: "deprecated".to_string(),
        arguments,
    }]
}

/// Parses a GraphQL value literal such as `"abc"`, `[1, 2]` or `{a: RED}`.
fn parse_value_literal(literal: &str) -> Option<Value<'static, String>> {
    let document = parse_document(&format!("{{ f(v: {}) }}", literal)).ok()?;
    let QueryDefinition::Operation(OperationDefinition::SelectionSet(selection_set)) =
        document.definitions.into_iter().next()?
    else {
        return None;
    };
    match selection_set.items.into_iter().next()? {
        Selection::Field(field) => field.arguments.into_iter().next().map(|(_, value)| value),
        _ => None,
    }
}

/// Fetches and converts the schema of the service behind `executor`,
/// retrying up to `attempts` times with a fixed `delay` between tries.
pub async fn introspect(
    executor: &RemoteExecutor,
    attempts: u32,
    delay: std::time::Duration,
) -> Result<RemoteSchema> {
    let service = executor.service().to_string();
    let request = ExecutionRequest {
        document: Arc::new(parse_document(INTROSPECTION_QUERY)?),
        variables: Map::new(),
        context: RequestContext::default(),
    };

    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match introspect_once(executor, &request).await {
            Ok(schema) => {
                debug!(service = %service, attempt, "introspection succeeded");
                return Ok(schema);
            }
            Err(e) if attempt < attempts => {
                warn!(service = %service, attempt, "introspection failed, retrying: {}", e);
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e.into_introspection(&service)),
        }
    }
}

async fn introspect_once(executor: &RemoteExecutor, request: &ExecutionRequest) -> Result<RemoteSchema> {
    let service = executor.service();
    let failure = |message: String| GatewayError::Introspection {
        service: service.to_string(),
        message,
    };

    let (status, body) = executor.send(request).await?;
    if !(200..300).contains(&status) {
        return Err(failure(format!("service answered with status {}", status)));
    }

    if let Some(errors) = body.get("errors").and_then(JsonValue::as_array) {
        if !errors.is_empty() {
            let messages: Vec<&str> = errors
                .iter()
                .filter_map(|error| error.get("message").and_then(JsonValue::as_str))
                .collect();
            return Err(failure(messages.join("; ")));
        }
    }

    let data = body
        .get("data")
        .filter(|data| !data.is_null())
        .ok_or_else(|| failure("response carries no data".to_string()))?;

    RemoteSchema::from_introspection(data).map_err(failure)
}
