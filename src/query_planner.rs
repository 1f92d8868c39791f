use async_trait::async_trait;
use graphql_parser::{
    Pos,
    query::{
        Definition, Directive, FragmentDefinition, InlineFragment, OperationDefinition, Selection,
        SelectionSet, Value,
    },
};
use serde_json::{Map, Value as JsonValue};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    Document, GraphQLRequest, OperationKind,
    error::{GatewayError, Result},
    parse_document,
    schema_registry::StitchedSchema,
};

#[async_trait]
pub trait QueryPlanner {
    async fn plan_query(
        &self,
        request: &GraphQLRequest,
        schema: &StitchedSchema,
    ) -> Result<Arc<QueryPlan>>;
}

/// How one inbound operation is spread over the services.
#[derive(Debug)]
pub struct QueryPlan {
    pub kind: OperationKind,
    /// For queries the steps are independent; for mutations they must run
    /// in order.
    pub steps: Vec<PlanStep>,
    /// Every root response key, in the order the operation selected them.
    pub response_keys: Vec<String>,
    /// Root `__typename` selections, answered by the gateway itself.
    pub typename_keys: Vec<LocalTypename>,
}

/// A root `__typename` together with the `@skip`/`@include` directives on
/// it and on every fragment enclosing it.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalTypename {
    pub key: String,
    pub conditions: Vec<Directive<'static, String>>,
}

impl LocalTypename {
    pub fn is_included(&self, variables: &Map<String, JsonValue>) -> bool {
        self.conditions.iter().all(|directive| {
            let condition = directive
                .arguments
                .iter()
                .find(|(name, _)| name == "if")
                .map(|(_, value)| match value {
                    Value::Boolean(flag) => *flag,
                    Value::Variable(name) => variables
                        .get(name)
                        .and_then(JsonValue::as_bool)
                        .unwrap_or(false),
                    _ => false,
                });
            match (directive.name.as_str(), condition) {
                ("include", Some(condition)) => condition,
                ("skip", Some(condition)) => !condition,
                _ => true,
            }
        })
    }
}

#[derive(Debug)]
pub struct PlanStep {
    pub service: String,
    pub document: Arc<Document>,
    pub variables: Vec<String>,
    pub response_keys: Vec<String>,
}

impl PlanStep {
    /// The subset of the inbound variables this step's document declares.
    pub fn select_variables(&self, all: &Map<String, JsonValue>) -> Map<String, JsonValue> {
        self.variables
            .iter()
            .filter_map(|name| all.get(name).map(|value| (name.clone(), value.clone())))
            .collect()
    }
}

/// Routes each root field to the service that owns it. Every root field's
/// subtree is delegated whole.
pub struct RootFieldPlanner {
    cache: PlanCache,
}

impl RootFieldPlanner {
    pub fn new(cache_size: usize) -> Self {
        RootFieldPlanner {
            cache: PlanCache::new(cache_size),
        }
    }

    fn build_plan(&self, request: &GraphQLRequest, schema: &StitchedSchema) -> Result<QueryPlan> {
        let document = parse_document(&request.query)?;
        let operation = select_operation(&document, request.operation_name.as_deref())?;

        let kind = match operation {
            OperationDefinition::SelectionSet(_) | OperationDefinition::Query(_) => {
                OperationKind::Query
            }
            OperationDefinition::Mutation(_) => OperationKind::Mutation,
            OperationDefinition::Subscription(_) => {
                return Err(GatewayError::Unsupported(
                    "Subscriptions are not supported by this gateway".to_string(),
                ));
            }
        };

        let fragments: HashMap<&str, &FragmentDefinition<'static, String>> = document
            .definitions
            .iter()
            .filter_map(|definition| match definition {
                Definition::Fragment(fragment) => Some((fragment.name.as_str(), fragment)),
                Definition::Operation(_) => None,
            })
            .collect();

        let mut visiting = Vec::new();
        let parts = partition(
            &selection_set(operation).items,
            &fragments,
            schema,
            kind,
            &mut visiting,
        )?;

        let mut response_keys: Vec<String> = Vec::new();
        let mut typename_keys = Vec::new();
        let mut groups: Vec<(String, Vec<Selection<'static, String>>, Vec<String>)> = Vec::new();

        for part in parts {
            for key in &part.keys {
                if !response_keys.contains(key) {
                    response_keys.push(key.clone());
                }
            }

            let Some(service) = part.service else {
                typename_keys.extend(part.keys.into_iter().map(|key| LocalTypename {
                    key,
                    conditions: part.conditions.clone(),
                }));
                continue;
            };

            let existing = match kind {
                // Queries collect every field of a service into one step.
                OperationKind::Query => groups.iter_mut().find(|(s, _, _)| *s == service),
                // Mutations only merge with the step right before them.
                OperationKind::Mutation => groups.last_mut().filter(|(s, _, _)| *s == service),
            };
            match existing {
                Some((_, items, keys)) => {
                    items.push(part.selection);
                    keys.extend(part.keys);
                }
                None => groups.push((service, vec![part.selection], part.keys)),
            }
        }

        let steps = groups
            .into_iter()
            .map(|(service, items, keys)| build_step(&document, operation, &fragments, service, items, keys))
            .collect();

        Ok(QueryPlan {
            kind,
            steps,
            response_keys,
            typename_keys,
        })
    }
}

#[async_trait]
impl QueryPlanner for RootFieldPlanner {
    async fn plan_query(
        &self,
        request: &GraphQLRequest,
        schema: &StitchedSchema,
    ) -> Result<Arc<QueryPlan>> {
        let key = (request.query.clone(), request.operation_name.clone());
        if let Some(plan) = self.cache.get(&key) {
            return Ok(plan);
        }

        let plan = Arc::new(self.build_plan(request, schema)?);
        self.cache.insert(key, plan.clone());
        Ok(plan)
    }
}

fn select_operation<'d>(
    document: &'d Document,
    operation_name: Option<&str>,
) -> Result<&'d OperationDefinition<'static, String>> {
    let operations: Vec<&OperationDefinition<'static, String>> = document
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            Definition::Operation(operation) => Some(operation),
            Definition::Fragment(_) => None,
        })
        .collect();

    match operation_name {
        Some(name) => operations
            .into_iter()
            .find(|operation| operation_name_of(operation) == Some(name))
            .ok_or_else(|| GatewayError::InvalidQuery(format!("Unknown operation named \"{}\".", name))),
        None => match operations.as_slice() {
            [operation] => Ok(*operation),
            [] => Err(GatewayError::InvalidQuery(
                "Document contains no operation".to_string(),
            )),
            _ => Err(GatewayError::InvalidQuery(
                "Must provide operation name if query contains multiple operations.".to_string(),
            )),
        },
    }
}

fn operation_name_of<'d>(operation: &'d OperationDefinition<'static, String>) -> Option<&'d str> {
    match operation {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(query) => query.name.as_deref(),
        OperationDefinition::Mutation(mutation) => mutation.name.as_deref(),
        OperationDefinition::Subscription(subscription) => subscription.name.as_deref(),
    }
}

fn selection_set<'d>(operation: &'d OperationDefinition<'static, String>) -> &'d SelectionSet<'static, String> {
    match operation {
        OperationDefinition::SelectionSet(set) => set,
        OperationDefinition::Query(query) => &query.selection_set,
        OperationDefinition::Mutation(mutation) => &mutation.selection_set,
        OperationDefinition::Subscription(subscription) => &subscription.selection_set,
    }
}

fn operation_directives<'d>(
    operation: &'d OperationDefinition<'static, String>,
) -> &'d [Directive<'static, String>] {
    match operation {
        OperationDefinition::SelectionSet(_) => &[],
        OperationDefinition::Query(query) => &query.directives,
        OperationDefinition::Mutation(mutation) => &mutation.directives,
        OperationDefinition::Subscription(subscription) => &subscription.directives,
    }
}

/// A root selection assigned to a service. `service` is `None` for the
/// gateway-answered `__typename`, whose directives are kept in `conditions`.
struct RootPart {
    service: Option<String>,
    selection: Selection<'static, String>,
    keys: Vec<String>,
    conditions: Vec<Directive<'static, String>>,
}

fn partition(
    items: &[Selection<'static, String>],
    fragments: &HashMap<&str, &FragmentDefinition<'static, String>>,
    schema: &StitchedSchema,
    kind: OperationKind,
    visiting: &mut Vec<String>,
) -> Result<Vec<RootPart>> {
    let mut parts = Vec::new();

    for item in items {
        match item {
            Selection::Field(field) => {
                let key = field.alias.clone().unwrap_or_else(|| field.name.clone());
                let (service, conditions) = if field.name == "__typename" {
                    (None, field.directives.clone())
                } else {
                    let owner = schema.owner_of(kind, &field.name).ok_or_else(|| {
                        GatewayError::InvalidQuery(format!(
                            "Cannot query field \"{}\" on type \"{}\".",
                            field.name,
                            schema.root_type_name(kind)
                        ))
                    })?;
                    (Some(owner.to_string()), Vec::new())
                };
                parts.push(RootPart {
                    service,
                    selection: item.clone(),
                    keys: vec![key],
                    conditions,
                });
            }
            Selection::FragmentSpread(spread) => {
                let name = spread.fragment_name.as_str();
                let fragment = fragments.get(name).ok_or_else(|| {
                    GatewayError::InvalidQuery(format!("Unknown fragment \"{}\".", name))
                })?;
                if visiting.iter().any(|v| v == name) {
                    return Err(GatewayError::InvalidQuery(format!(
                        "Cannot spread fragment \"{}\" within itself.",
                        name
                    )));
                }

                visiting.push(name.to_string());
                let inner = partition(&fragment.selection_set.items, fragments, schema, kind, visiting)?;
                visiting.pop();
                parts.extend(wrap_conditional(inner, &spread.directives, kind));
            }
            Selection::InlineFragment(inline) => {
                let inner = partition(&inline.selection_set.items, fragments, schema, kind, visiting)?;
                parts.extend(wrap_conditional(inner, &inline.directives, kind));
            }
        }
    }

    Ok(parts)
}

/// Root fragments without directives are flattened away. A fragment that
/// carries directives (`@include`, `@skip`, ...) is split into inline
/// fragments per service, each keeping the directives, so the condition is
/// still evaluated by the backend. For mutations only adjacent fields of one
/// service share a fragment, keeping execution order intact.
fn wrap_conditional(
    inner: Vec<RootPart>,
    directives: &[Directive<'static, String>],
    kind: OperationKind,
) -> Vec<RootPart> {
    if directives.is_empty() {
        return inner;
    }

    let mut wrapped: Vec<RootPart> = Vec::new();
    for mut part in inner {
        let Some(service) = part.service.clone() else {
            part.conditions.extend(directives.iter().cloned());
            wrapped.push(part);
            continue;
        };

        let same_service =
            |candidate: &&mut RootPart| candidate.service.as_deref() == Some(service.as_str());
        let existing = match kind {
            OperationKind::Query => wrapped.iter_mut().find(same_service),
            OperationKind::Mutation => wrapped.last_mut().filter(same_service),
        };
        match existing {
            Some(RootPart {
                selection: Selection::InlineFragment(fragment),
                keys,
                ..
            }) => {
                fragment.selection_set.items.push(part.selection);
                keys.extend(part.keys);
            }
            _ => wrapped.push(RootPart {
                service: Some(service),
                selection: Selection::InlineFragment(InlineFragment {
                    position: Pos::default(),
                    type_condition: None,
                    directives: directives.to_vec(),
                    selection_set: SelectionSet {
                        span: (Pos::default(), Pos::default()),
                        items: vec![part.selection],
                    },
                }),
                keys: part.keys,
                conditions: Vec::new(),
            }),
        }
    }
    wrapped
}

fn build_step(
    document: &Document,
    operation: &OperationDefinition<'static, String>,
    fragments: &HashMap<&str, &FragmentDefinition<'static, String>>,
    service: String,
    items: Vec<Selection<'static, String>>,
    response_keys: Vec<String>,
) -> PlanStep {
    let mut usage = Usage::default();
    usage.directives(operation_directives(operation));
    usage.selections(&items, fragments);

    let step_operation = match operation {
        OperationDefinition::Query(query) => {
            let mut query = query.clone();
            query
                .variable_definitions
                .retain(|definition| usage.variables.contains(&definition.name));
            query.selection_set.items = items;
            OperationDefinition::Query(query)
        }
        OperationDefinition::Mutation(mutation) => {
            let mut mutation = mutation.clone();
            mutation
                .variable_definitions
                .retain(|definition| usage.variables.contains(&definition.name));
            mutation.selection_set.items = items;
            OperationDefinition::Mutation(mutation)
        }
        other => {
            let mut set = selection_set(other).clone();
            set.items = items;
            OperationDefinition::SelectionSet(set)
        }
    };

    let mut definitions = vec![Definition::Operation(step_operation)];
    // Keep fragments in document order.
    definitions.extend(document.definitions.iter().filter_map(|definition| match definition {
        Definition::Fragment(fragment) if usage.fragments.contains(&fragment.name) => {
            Some(Definition::Fragment(fragment.clone()))
        }
        _ => None,
    }));

    PlanStep {
        service,
        document: Arc::new(Document { definitions }),
        variables: usage.variables,
        response_keys,
    }
}

/// Variables and fragments reachable from a set of selections.
#[derive(Default)]
struct Usage {
    variables: Vec<String>,
    fragments: Vec<String>,
}

impl Usage {
    fn selections(
        &mut self,
        items: &[Selection<'static, String>],
        fragments: &HashMap<&str, &FragmentDefinition<'static, String>>,
    ) {
        for item in items {
            match item {
                Selection::Field(field) => {
                    for (_, value) in &field.arguments {
                        self.value(value);
                    }
                    self.directives(&field.directives);
                    self.selections(&field.selection_set.items, fragments);
                }
                Selection::FragmentSpread(spread) => {
                    self.directives(&spread.directives);
                    if self.fragments.contains(&spread.fragment_name) {
                        continue;
                    }
                    self.fragments.push(spread.fragment_name.clone());
                    if let Some(fragment) = fragments.get(spread.fragment_name.as_str()) {
                        self.directives(&fragment.directives);
                        self.selections(&fragment.selection_set.items, fragments);
                    }
                }
                Selection::InlineFragment(inline) => {
                    self.directives(&inline.directives);
                    self.selections(&inline.selection_set.items, fragments);
                }
            }
        }
    }

    fn directives(&mut self, directives: &[Directive<'static, String>]) {
        for directive in directives {
            for (_, value) in &directive.arguments {
                self.value(value);
            }
        }
    }

    fn value(&mut self, value: &Value<'static, String>) {
        match value {
            Value::Variable(name) => {
                if !self.variables.contains(name) {
                    self.variables.push(name.clone());
                }
            }
            Value::List(values) => values.iter().for_each(|v| self.value(v)),
            Value::Object(fields) => fields.values().for_each(|v| self.value(v)),
            _ => {}
        }
    }
}

type PlanKey = (String, Option<String>);

/// Plans keyed by query text and operation name. Bounded; the oldest entry
/// goes first once full.
struct PlanCache {
    capacity: usize,
    inner: Mutex<PlanCacheInner>,
}

#[derive(Default)]
struct PlanCacheInner {
    plans: HashMap<PlanKey, Arc<QueryPlan>>,
    order: VecDeque<PlanKey>,
}

impl PlanCache {
    fn new(capacity: usize) -> Self {
        PlanCache {
            capacity,
            inner: Mutex::new(PlanCacheInner::default()),
        }
    }

    fn get(&self, key: &PlanKey) -> Option<Arc<QueryPlan>> {
        self.lock().plans.get(key).cloned()
    }

    fn insert(&self, key: PlanKey, plan: Arc<QueryPlan>) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.lock();
        if inner.plans.insert(key.clone(), plan).is_none() {
            inner.order.push_back(key);
        }
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.plans.remove(&oldest);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlanCacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_registry::tests::{Unreachable, subschema_with};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn schema() -> StitchedSchema {
        StitchedSchema::stitch(vec![
            subschema_with("a", &["helloA", "usersA"], &["renameA", "resetA"], Arc::new(Unreachable)),
            subschema_with("b", &["helloB"], &["renameB"], Arc::new(Unreachable)),
        ])
    }

    fn planned(query: &str, operation_name: Option<&str>) -> Result<QueryPlan> {
        let request = GraphQLRequest {
            query: query.to_string(),
            variables: None,
            operation_name: operation_name.map(str::to_string),
        };
        RootFieldPlanner::new(0).build_plan(&request, &schema())
    }

    fn services(plan: &QueryPlan) -> Vec<&str> {
        plan.steps.iter().map(|s| s.service.as_str()).collect()
    }

    #[test]
    fn root_fields_split_by_service() {
        let plan = planned(
            "query Q($n: String, $m: String) { helloA(name: $n) helloB(name: $m) kind: __typename usersA }",
            None,
        )
        .unwrap();

        assert_eq!(plan.kind, OperationKind::Query);
        assert_eq!(services(&plan), vec!["a", "b"]);
        assert_eq!(plan.response_keys, vec!["helloA", "helloB", "kind", "usersA"]);
        assert_eq!(
            plan.typename_keys,
            vec![LocalTypename {
                key: "kind".to_string(),
                conditions: Vec::new(),
            }]
        );

        let a = &plan.steps[0];
        let printed = a.document.to_string();
        assert!(printed.starts_with("query Q($n: String)"), "{}", printed);
        assert!(printed.contains("helloA(name: $n)"));
        assert!(printed.contains("usersA"));
        assert!(!printed.contains("helloB"));
        assert_eq!(a.variables, vec!["n"]);
        assert_eq!(a.response_keys, vec!["helloA", "usersA"]);

        let b = &plan.steps[1];
        assert_eq!(b.variables, vec!["m"]);
        assert!(!b.document.to_string().contains("$n"));
    }

    #[test]
    fn variables_are_filtered_per_step() {
        let plan = planned("query($n: String, $m: String) { helloA(name: $n) helloB(name: $m) }", None).unwrap();
        let all = json!({ "n": "A", "m": "B", "unused": 1 });
        let all = all.as_object().unwrap();

        assert_eq!(
            JsonValue::Object(plan.steps[0].select_variables(all)),
            json!({ "n": "A" })
        );
        assert_eq!(
            JsonValue::Object(plan.steps[1].select_variables(all)),
            json!({ "m": "B" })
        );
    }

    #[test]
    fn plain_root_fragments_are_flattened() {
        let plan = planned("{ ...Both } fragment Both on Query { helloA helloB }", None).unwrap();

        assert_eq!(services(&plan), vec!["a", "b"]);
        for step in &plan.steps {
            let printed = step.document.to_string();
            assert!(!printed.contains("Both"), "{}", printed);
        }
        assert_eq!(plan.response_keys, vec!["helloA", "helloB"]);
    }

    #[test]
    fn conditional_root_fragments_keep_their_directives() {
        let plan = planned(
            "query($x: Boolean!) { ... @include(if: $x) { helloA } helloB }",
            None,
        )
        .unwrap();

        let a = plan.steps[0].document.to_string();
        assert!(a.contains("@include(if: $x)"), "{}", a);
        assert!(a.contains("$x: Boolean!"), "{}", a);
        assert_eq!(plan.steps[0].variables, vec!["x"]);

        let b = plan.steps[1].document.to_string();
        assert!(!b.contains("$x"), "{}", b);
    }

    #[test]
    fn nested_fragments_travel_with_their_step() {
        let plan = planned(
            "query { usersA { ...UserFields } helloB } fragment UserFields on User { id ...More } fragment More on User { name } fragment Unused on User { id }",
            None,
        )
        .unwrap();

        let a = plan.steps[0].document.to_string();
        assert!(a.contains("fragment UserFields on User"), "{}", a);
        assert!(a.contains("fragment More on User"), "{}", a);
        assert!(!a.contains("Unused"), "{}", a);
        assert!(!plan.steps[1].document.to_string().contains("fragment"));
    }

    #[test]
    fn unknown_root_field_is_rejected() {
        let err = planned("{ nope }", None).unwrap_err();
        assert_eq!(
            err,
            GatewayError::InvalidQuery("Cannot query field \"nope\" on type \"Query\".".to_string())
        );
    }

    #[test]
    fn operation_is_selected_by_name() {
        let document = "query One { helloA } query Two { helloB }";
        assert!(matches!(planned(document, None), Err(GatewayError::InvalidQuery(_))));

        let two = planned(document, Some("Two")).unwrap();
        assert_eq!(services(&two), vec!["b"]);

        assert!(matches!(planned(document, Some("Three")), Err(GatewayError::InvalidQuery(_))));
    }

    #[test]
    fn mutation_steps_keep_field_order() {
        let plan = planned("mutation { renameA renameB resetA }", None).unwrap();
        assert_eq!(plan.kind, OperationKind::Mutation);
        assert_eq!(services(&plan), vec!["a", "b", "a"]);

        let merged = planned("mutation { renameA resetA renameB }", None).unwrap();
        assert_eq!(services(&merged), vec!["a", "b"]);
        assert!(merged.steps[0].document.to_string().contains("resetA"));

        let conditional = planned(
            "mutation($x: Boolean!) { ... @include(if: $x) { renameA renameB resetA } }",
            None,
        )
        .unwrap();
        assert_eq!(services(&conditional), vec!["a", "b", "a"]);
        let first = conditional.steps[0].document.to_string();
        assert!(first.contains("@include(if: $x)"), "{}", first);
        assert!(!first.contains("resetA"), "{}", first);
        assert_eq!(conditional.steps[2].response_keys, vec!["resetA"]);
    }

    #[test]
    fn conditional_query_fragments_still_group_by_service() {
        let plan = planned(
            "query($x: Boolean!) { ... @include(if: $x) { helloA helloB usersA } }",
            None,
        )
        .unwrap();
        assert_eq!(services(&plan), vec!["a", "b"]);
        assert_eq!(plan.steps[0].response_keys, vec!["helloA", "usersA"]);
    }

    #[test]
    fn conditional_typename_follows_its_directives() {
        let plan = planned(
            "query($x: Boolean!, $y: Boolean!) { helloA ... @include(if: $x) { t1: __typename } t2: __typename @skip(if: $y) t3: __typename @include(if: true) }",
            None,
        )
        .unwrap();
        assert_eq!(plan.typename_keys.len(), 3);

        let vars = json!({ "x": false, "y": true });
        let vars = vars.as_object().unwrap();
        let included: Vec<&str> = plan
            .typename_keys
            .iter()
            .filter(|local| local.is_included(vars))
            .map(|local| local.key.as_str())
            .collect();
        assert_eq!(included, vec!["t3"]);

        let vars = json!({ "x": true, "y": false });
        let vars = vars.as_object().unwrap();
        assert!(plan.typename_keys.iter().all(|local| local.is_included(vars)));
    }

    #[test]
    fn subscriptions_are_unsupported() {
        let err = planned("subscription { helloA }", None).unwrap_err();
        assert!(matches!(err, GatewayError::Unsupported(_)));
    }

    #[test]
    fn recursive_fragments_are_rejected() {
        let err = planned("{ ...A } fragment A on Query { ...A }", None).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn plans_are_cached_by_query_text() {
        let planner = RootFieldPlanner::new(1);
        let schema = schema();
        let request = GraphQLRequest {
            query: "{ helloA }".to_string(),
            ..Default::default()
        };
        let other = GraphQLRequest {
            query: "{ helloB }".to_string(),
            ..Default::default()
        };

        let first = planner.plan_query(&request, &schema).await.unwrap();
        let second = planner.plan_query(&request, &schema).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first.steps[0].document, &second.steps[0].document));

        planner.plan_query(&other, &schema).await.unwrap();
        let evicted = planner.plan_query(&request, &schema).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &evicted));
    }
}
