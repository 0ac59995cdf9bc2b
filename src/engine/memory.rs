use crate::engine::traits::{BatchResult, Engine, EngineCapabilities};
use crate::error::EngineError;
use crate::model::{
    BatchTransaction, FieldDefault, FieldDescriptor, ModelAction, ModelCatalog, ModelDescriptor,
    Request, TransactionOptions, TransactionRef,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

type Row = Map<String, Value>;

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: HashMap<String, Vec<Row>>,
    sequences: HashMap<String, i64>,
}

/// Calls observed by the engine, in arrival order
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Connect,
    Execute {
        model: String,
        action: ModelAction,
        transaction: Option<String>,
    },
    Batch {
        operations: Vec<String>,
        atomic: bool,
    },
    StartTransaction {
        id: String,
    },
    Commit {
        id: String,
    },
    Rollback {
        id: String,
    },
}

/// In-process engine over plain tables. Interactive transactions work on a
/// snapshot that replaces the committed tables on commit.
pub struct MemoryEngine {
    catalog: Arc<ModelCatalog>,
    capabilities: EngineCapabilities,
    retryable_codes: Vec<String>,
    connect_error: Option<EngineError>,
    committed: Mutex<Tables>,
    transactions: Mutex<HashMap<String, Tables>>,
    events: Mutex<Vec<EngineEvent>>,
    failures: Mutex<VecDeque<EngineError>>,
}

impl MemoryEngine {
    pub fn new(catalog: Arc<ModelCatalog>) -> Self {
        Self {
            catalog,
            capabilities: EngineCapabilities::default(),
            retryable_codes: Vec::new(),
            connect_error: None,
            committed: Mutex::new(Tables::default()),
            transactions: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: EngineCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Errors carrying this code are reported as retryable
    pub fn with_retryable_code(mut self, code: impl Into<String>) -> Self {
        self.retryable_codes.push(code.into());
        self
    }

    pub fn with_connect_error(mut self, error: EngineError) -> Self {
        self.connect_error = Some(error);
        self
    }

    /// Make the next physical query call fail as a whole
    pub fn fail_next(&self, error: EngineError) {
        self.failures.lock().push_back(error);
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    /// Committed rows of a model
    pub fn rows(&self, model: &str) -> Vec<Value> {
        self.committed
            .lock()
            .rows
            .get(model)
            .map(|rows| rows.iter().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    pub fn open_transactions(&self) -> usize {
        self.transactions.lock().len()
    }

    fn record(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }

    fn take_failure(&self) -> Option<EngineError> {
        self.failures.lock().pop_front()
    }

    /// Run one request against `tables`, leaving them untouched on failure
    fn run_on(&self, tables: &mut Tables, request: &Request) -> Result<Value, EngineError> {
        let mut scratch = tables.clone();
        let result = Operation {
            catalog: &self.catalog,
            tables: &mut scratch,
        }
        .run(request)?;
        *tables = scratch;
        Ok(result)
    }
}

#[async_trait::async_trait]
impl Engine for MemoryEngine {
    fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    async fn connect(&self) -> Result<(), EngineError> {
        self.record(EngineEvent::Connect);
        match &self.connect_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn execute(&self, request: &Request) -> Result<Value, EngineError> {
        self.record(EngineEvent::Execute {
            model: request.model.clone(),
            action: request.action,
            transaction: request.transaction.as_ref().map(|tx| tx.id.clone()),
        });
        if let Some(error) = self.take_failure() {
            return Err(error);
        }

        match &request.transaction {
            Some(transaction) => {
                let mut transactions = self.transactions.lock();
                let tables = transactions
                    .get_mut(&transaction.id)
                    .ok_or_else(|| transaction_not_found(&transaction.id))?;
                self.run_on(tables, request)
            }
            None => {
                let mut committed = self.committed.lock();
                self.run_on(&mut committed, request)
            }
        }
    }

    async fn execute_batch(
        &self,
        requests: &[Request],
        transaction: Option<&BatchTransaction>,
    ) -> Result<BatchResult, EngineError> {
        self.record(EngineEvent::Batch {
            operations: requests.iter().map(Request::root_name).collect(),
            atomic: transaction.is_some(),
        });
        if let Some(error) = self.take_failure() {
            return Err(error);
        }

        let mut committed = self.committed.lock();
        if transaction.is_some() {
            let mut scratch = committed.clone();
            let mut results = Vec::with_capacity(requests.len());
            for request in requests {
                results.push(Ok(self.run_on(&mut scratch, request)?));
            }
            *committed = scratch;
            return Ok(results);
        }

        Ok(requests
            .iter()
            .map(|request| self.run_on(&mut committed, request))
            .collect())
    }

    async fn start_transaction(
        &self,
        _options: &TransactionOptions,
    ) -> Result<TransactionRef, EngineError> {
        let id = uuid::Uuid::new_v4().to_string();
        let snapshot = self.committed.lock().clone();
        self.transactions.lock().insert(id.clone(), snapshot);
        self.record(EngineEvent::StartTransaction { id: id.clone() });
        Ok(TransactionRef::new(id))
    }

    async fn commit_transaction(&self, transaction: &TransactionRef) -> Result<(), EngineError> {
        self.record(EngineEvent::Commit {
            id: transaction.id.clone(),
        });
        let tables = self
            .transactions
            .lock()
            .remove(&transaction.id)
            .ok_or_else(|| transaction_not_found(&transaction.id))?;
        *self.committed.lock() = tables;
        Ok(())
    }

    async fn rollback_transaction(
        &self,
        transaction: &TransactionRef,
    ) -> Result<(), EngineError> {
        self.record(EngineEvent::Rollback {
            id: transaction.id.clone(),
        });
        self.transactions
            .lock()
            .remove(&transaction.id)
            .map(|_| ())
            .ok_or_else(|| transaction_not_found(&transaction.id))
    }

    fn is_retryable(&self, error: &EngineError) -> bool {
        error
            .code
            .as_ref()
            .map(|code| self.retryable_codes.contains(code))
            .unwrap_or(false)
    }
}

fn transaction_not_found(id: &str) -> EngineError {
    EngineError::transaction(
        "P2028",
        format!("Transaction not found. Transaction ID is invalid: {}", id),
    )
}

fn record_not_found(what: &str) -> EngineError {
    EngineError::known(
        "P2025",
        format!(
            "An operation failed because it depends on one or more records that were required but not found. {}",
            what
        ),
    )
}

/// A single request evaluated against a set of tables
struct Operation<'a> {
    catalog: &'a ModelCatalog,
    tables: &'a mut Tables,
}

impl<'a> Operation<'a> {
    fn run(&mut self, request: &Request) -> Result<Value, EngineError> {
        let model = self.catalog.get_model(&request.model).ok_or_else(|| {
            EngineError::known(
                "P2021",
                format!("The model `{}` does not exist", request.model),
            )
        })?;
        let args = request.args.as_object().cloned().unwrap_or_default();

        let payload = match request.action.wire_action() {
            ModelAction::FindUnique
            | ModelAction::FindUniqueOrThrow
            | ModelAction::FindFirst
            | ModelAction::FindFirstOrThrow => self
                .find(&model, &args)
                .first()
                .map(|row| self.project(&model, row, &args))
                .unwrap_or(Value::Null),
            ModelAction::FindMany => Value::Array(
                self.find(&model, &args)
                    .iter()
                    .map(|row| self.project(&model, row, &args))
                    .collect(),
            ),
            ModelAction::Create => {
                let data = object_arg(&args, "data");
                let row = self.create(&model, &data)?;
                self.project(&model, &row, &args)
            }
            ModelAction::CreateMany => {
                let data = args.get("data").cloned().unwrap_or(Value::Null);
                let items = match data {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    single => vec![single],
                };
                for item in &items {
                    self.create(&model, &item.as_object().cloned().unwrap_or_default())?;
                }
                json!({ "count": items.len() })
            }
            ModelAction::Update => {
                let index = self
                    .first_index(&model, args.get("where"))
                    .ok_or_else(|| record_not_found("Record to update not found."))?;
                let row = self.update_at(&model, index, &object_arg(&args, "data"))?;
                self.project(&model, &row, &args)
            }
            ModelAction::UpdateMany => {
                let data = object_arg(&args, "data");
                let indexes = self.matching_indexes(&model, args.get("where"));
                for &index in &indexes {
                    self.update_at(&model, index, &data)?;
                }
                json!({ "count": indexes.len() })
            }
            ModelAction::Upsert => {
                let row = match self.first_index(&model, args.get("where")) {
                    Some(index) => self.update_at(&model, index, &object_arg(&args, "update"))?,
                    None => self.create(&model, &object_arg(&args, "create"))?,
                };
                self.project(&model, &row, &args)
            }
            ModelAction::Delete => {
                let index = self
                    .first_index(&model, args.get("where"))
                    .ok_or_else(|| record_not_found("Record to delete does not exist."))?;
                let row = self.table(&model.name)[index].clone();
                let projected = self.project(&model, &row, &args);
                self.table_mut(&model.name).remove(index);
                projected
            }
            ModelAction::DeleteMany => {
                let indexes = self.matching_indexes(&model, args.get("where"));
                let table = self.table_mut(&model.name);
                let mut position = 0;
                table.retain(|_| {
                    let keep = !indexes.contains(&position);
                    position += 1;
                    keep
                });
                json!({ "count": indexes.len() })
            }
            ModelAction::Aggregate | ModelAction::Count => {
                let rows = self.find(&model, &args);
                Value::Object(aggregate_rows(&rows, &object_arg(&args, "select")))
            }
            ModelAction::GroupBy => self.group_by(&model, &args),
        };

        Ok(json!({ request.root_name(): payload }))
    }

    fn table(&self, model: &str) -> &[Row] {
        self.tables
            .rows
            .get(model)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn table_mut(&mut self, model: &str) -> &mut Vec<Row> {
        self.tables.rows.entry(model.to_string()).or_default()
    }

    fn matching_indexes(&self, model: &ModelDescriptor, filter: Option<&Value>) -> Vec<usize> {
        self.table(&model.name)
            .iter()
            .enumerate()
            .filter(|(_, row)| filter.map_or(true, |filter| matches_filter(row, filter)))
            .map(|(index, _)| index)
            .collect()
    }

    fn first_index(&self, model: &ModelDescriptor, filter: Option<&Value>) -> Option<usize> {
        self.matching_indexes(model, filter).first().copied()
    }

    /// Filtered, ordered and paginated rows
    fn find(&self, model: &ModelDescriptor, args: &Map<String, Value>) -> Vec<Row> {
        let rows: Vec<Row> = self.table(&model.name).to_vec();
        select_rows(rows, args)
    }

    fn project(&self, model: &ModelDescriptor, row: &Row, args: &Map<String, Value>) -> Value {
        let mut out = Map::new();

        if let Some(select) = args.get("select").and_then(Value::as_object) {
            for (key, selection) in select {
                if !is_truthy(selection) {
                    continue;
                }
                if key == "_count" {
                    out.insert(key.clone(), self.count_relations(model, row, selection));
                    continue;
                }
                let Some(field) = model.field(key) else {
                    continue;
                };
                let value = if field.is_relation() {
                    self.resolve_relation(model, field, row, &nested_args(selection))
                } else {
                    row.get(key).cloned().unwrap_or(Value::Null)
                };
                out.insert(key.clone(), value);
            }
            return Value::Object(out);
        }

        for field in model.fields.iter().filter(|field| !field.is_relation()) {
            out.insert(
                field.name.clone(),
                row.get(&field.name).cloned().unwrap_or(Value::Null),
            );
        }
        if let Some(include) = args.get("include").and_then(Value::as_object) {
            for (key, selection) in include {
                if !is_truthy(selection) {
                    continue;
                }
                if key == "_count" {
                    out.insert(key.clone(), self.count_relations(model, row, selection));
                } else if let Some(field) = model.field(key).filter(|field| field.is_relation()) {
                    let value = self.resolve_relation(model, field, row, &nested_args(selection));
                    out.insert(key.clone(), value);
                }
            }
        }
        Value::Object(out)
    }

    fn related_rows(&self, model: &ModelDescriptor, field: &FieldDescriptor, row: &Row) -> Vec<Row> {
        let (Some(relation), Some(target)) = (&field.relation, self.catalog.get_model(&field.type_name))
        else {
            return Vec::new();
        };

        // (column on the target, value it must equal)
        let pairs: Vec<(String, Value)> = if !relation.fields.is_empty() {
            relation
                .references
                .iter()
                .zip(&relation.fields)
                .map(|(target_column, local)| {
                    (target_column.clone(), row.get(local).cloned().unwrap_or(Value::Null))
                })
                .collect()
        } else {
            let opposite = target.relation_fields().find(|candidate| {
                candidate.type_name == model.name
                    && candidate
                        .relation
                        .as_ref()
                        .map_or(false, |info| info.name == relation.name && !info.fields.is_empty())
            });
            let Some(opposite) = opposite.and_then(|field| field.relation.as_ref()) else {
                return Vec::new();
            };
            opposite
                .fields
                .iter()
                .zip(&opposite.references)
                .map(|(target_column, local)| {
                    (target_column.clone(), row.get(local).cloned().unwrap_or(Value::Null))
                })
                .collect()
        };

        if pairs.is_empty() || pairs.iter().any(|(_, value)| value.is_null()) {
            return Vec::new();
        }

        self.table(&target.name)
            .iter()
            .filter(|candidate| {
                pairs.iter().all(|(column, expected)| {
                    candidate
                        .get(column)
                        .map_or(false, |actual| values_equal(actual, expected))
                })
            })
            .cloned()
            .collect()
    }

    fn resolve_relation(
        &self,
        model: &ModelDescriptor,
        field: &FieldDescriptor,
        row: &Row,
        args: &Map<String, Value>,
    ) -> Value {
        let Some(target) = self.catalog.get_model(&field.type_name) else {
            return Value::Null;
        };
        let related = select_rows(self.related_rows(model, field, row), args);

        if field.is_list {
            Value::Array(
                related
                    .iter()
                    .map(|related_row| self.project(&target, related_row, args))
                    .collect(),
            )
        } else {
            related
                .first()
                .map(|related_row| self.project(&target, related_row, args))
                .unwrap_or(Value::Null)
        }
    }

    fn count_relations(&self, model: &ModelDescriptor, row: &Row, selection: &Value) -> Value {
        let requested = selection
            .get("select")
            .and_then(Value::as_object)
            .map(|select| {
                select
                    .iter()
                    .filter(|(_, value)| is_truthy(value))
                    .map(|(key, _)| key.clone())
                    .collect::<Vec<_>>()
            });

        let mut counts = Map::new();
        for field in model.relation_fields().filter(|field| field.is_list) {
            if requested
                .as_ref()
                .map_or(true, |names| names.contains(&field.name))
            {
                let count = self.related_rows(model, field, row).len();
                counts.insert(field.name.clone(), json!(count));
            }
        }
        Value::Object(counts)
    }

    fn default_value(&mut self, model: &ModelDescriptor, field: &FieldDescriptor) -> Option<Value> {
        match field.default.as_ref()? {
            FieldDefault::Uuid => Some(json!(uuid::Uuid::new_v4().to_string())),
            FieldDefault::Autoincrement => {
                let key = format!("{}.{}", model.name, field.name);
                let sequence = self.tables.sequences.entry(key).or_insert(0);
                *sequence += 1;
                Some(json!(*sequence))
            }
            FieldDefault::Now => Some(json!(chrono::Utc::now().to_rfc3339())),
            FieldDefault::Value(value) => Some(value.clone()),
        }
    }

    fn create(&mut self, model: &ModelDescriptor, data: &Map<String, Value>) -> Result<Row, EngineError> {
        // connect on the side that owns the foreign key
        let mut connected = Row::new();
        for field in model.relation_fields() {
            let (Some(relation), Some(connect)) = (
                &field.relation,
                data.get(&field.name).and_then(|value| value.get("connect")),
            ) else {
                continue;
            };
            for (local, reference) in relation.fields.iter().zip(&relation.references) {
                if let Some(value) = connect.get(reference) {
                    connected.insert(local.clone(), value.clone());
                }
            }
        }

        let mut row = Row::new();
        for field in model.fields.iter().filter(|field| !field.is_relation()) {
            let value = match data.get(&field.name).or_else(|| connected.get(&field.name)) {
                Some(value) if field.is_composite() => unwrap_set(value),
                Some(value) => value.clone(),
                None => match self.default_value(model, field) {
                    Some(value) => value,
                    None if field.is_list => json!([]),
                    None if field.is_nullable() => Value::Null,
                    None => {
                        return Err(EngineError::known(
                            "P2012",
                            format!(
                                "Missing a required value at `{}.{}`",
                                model.name, field.name
                            ),
                        ))
                    }
                },
            };
            row.insert(field.name.clone(), value);
        }

        self.check_unique(model, &row, None)?;
        self.table_mut(&model.name).push(row.clone());

        // nested creates on back relations
        for field in model.relation_fields() {
            let Some(create) = data.get(&field.name).and_then(|value| value.get("create")) else {
                continue;
            };
            let Some(target) = self.catalog.get_model(&field.type_name) else {
                continue;
            };
            let opposite = target
                .relation_fields()
                .find(|candidate| {
                    candidate.relation.as_ref().zip(field.relation.as_ref()).map_or(
                        false,
                        |(theirs, ours)| theirs.name == ours.name && !theirs.fields.is_empty(),
                    )
                })
                .and_then(|candidate| candidate.relation.clone());
            let Some(opposite) = opposite else {
                continue;
            };

            let children = match create {
                Value::Array(items) => items.clone(),
                single => vec![single.clone()],
            };
            for child in children {
                let mut child_data = child.as_object().cloned().unwrap_or_default();
                for (foreign, local) in opposite.fields.iter().zip(&opposite.references) {
                    child_data.insert(foreign.clone(), row.get(local).cloned().unwrap_or(Value::Null));
                }
                self.create(&target, &child_data)?;
            }
        }

        Ok(row)
    }

    fn update_at(
        &mut self,
        model: &ModelDescriptor,
        index: usize,
        data: &Map<String, Value>,
    ) -> Result<Row, EngineError> {
        let mut row = self.table(&model.name)[index].clone();

        for (key, value) in data {
            let Some(field) = model.field(key) else {
                return Err(EngineError::known(
                    "P2009",
                    format!("Unknown argument `{}` on model `{}`", key, model.name),
                ));
            };
            if field.is_relation() {
                continue;
            }
            let current = row.get(key).cloned().unwrap_or(Value::Null);
            let next = if field.is_composite() {
                if value.get("unset").is_some() {
                    Value::Null
                } else {
                    unwrap_set(value)
                }
            } else {
                apply_scalar_update(&current, value)
            };
            row.insert(key.clone(), next);
        }

        self.check_unique(model, &row, Some(index))?;
        self.table_mut(&model.name)[index] = row.clone();
        Ok(row)
    }

    fn check_unique(&self, model: &ModelDescriptor, row: &Row, skip: Option<usize>) -> Result<(), EngineError> {
        for field in model.fields.iter().filter(|field| field.is_id || field.is_unique) {
            let Some(value) = row.get(&field.name).filter(|value| !value.is_null()) else {
                continue;
            };
            let duplicate = self
                .table(&model.name)
                .iter()
                .enumerate()
                .any(|(index, other)| {
                    Some(index) != skip
                        && other
                            .get(&field.name)
                            .map_or(false, |existing| values_equal(existing, value))
                });
            if duplicate {
                return Err(EngineError::known(
                    "P2002",
                    format!("Unique constraint failed on the fields: (`{}`)", field.name),
                )
                .with_meta(json!({ "target": [field.name] })));
            }
        }
        Ok(())
    }

    fn group_by(&self, model: &ModelDescriptor, args: &Map<String, Value>) -> Value {
        let by: Vec<String> = match args.get("by") {
            Some(Value::Array(fields)) => fields
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(field)) => vec![field.clone()],
            _ => Vec::new(),
        };
        let select = object_arg(args, "select");
        let rows = self.find(model, args);

        let mut groups: Vec<(Vec<Value>, Vec<Row>)> = Vec::new();
        for row in rows {
            let key: Vec<Value> = by
                .iter()
                .map(|field| row.get(field).cloned().unwrap_or(Value::Null))
                .collect();
            match groups.iter_mut().find(|(existing, _)| *existing == key) {
                Some((_, members)) => members.push(row),
                None => groups.push((key, vec![row])),
            }
        }

        Value::Array(
            groups
                .into_iter()
                .map(|(key, members)| {
                    let mut group = aggregate_rows(&members, &select);
                    for (field, value) in by.iter().zip(key) {
                        group.insert(field.clone(), value);
                    }
                    Value::Object(group)
                })
                .collect(),
        )
    }
}

fn object_arg(args: &Map<String, Value>, key: &str) -> Map<String, Value> {
    args.get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn nested_args(selection: &Value) -> Map<String, Value> {
    selection.as_object().cloned().unwrap_or_default()
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Object(_) => true,
        _ => false,
    }
}

fn unwrap_set(value: &Value) -> Value {
    match value.get("set") {
        Some(inner) if value.as_object().map_or(false, |map| map.len() == 1) => inner.clone(),
        _ => value.clone(),
    }
}

fn apply_scalar_update(current: &Value, update: &Value) -> Value {
    let Some(operation) = update.as_object().filter(|map| map.len() == 1) else {
        return update.clone();
    };
    let Some((name, operand)) = operation.iter().next() else {
        return update.clone();
    };
    let arithmetic = |apply: fn(f64, f64) -> f64| match (current.as_f64(), operand.as_f64()) {
        (Some(left), Some(right)) => number_value(apply(left, right), current, operand),
        _ => current.clone(),
    };
    match name.as_str() {
        "set" => operand.clone(),
        "increment" => arithmetic(|left, right| left + right),
        "decrement" => arithmetic(|left, right| left - right),
        "multiply" => arithmetic(|left, right| left * right),
        "divide" => arithmetic(|left, right| left / right),
        _ => update.clone(),
    }
}

/// Keep integers integral when both operands were
fn number_value(result: f64, left: &Value, right: &Value) -> Value {
    if (left.is_i64() || left.is_u64()) && (right.is_i64() || right.is_u64()) && result.fract() == 0.0 {
        json!(result as i64)
    } else {
        json!(result)
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) if left.is_number() && right.is_number() => a == b,
        _ => left == right,
    }
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        _ => None,
    }
}

const FILTER_OPERATORS: [&str; 11] = [
    "equals", "in", "notIn", "not", "lt", "lte", "gt", "gte", "contains", "startsWith", "endsWith",
];

fn as_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

fn matches_filter(row: &Row, filter: &Value) -> bool {
    let Some(filter) = filter.as_object() else {
        return true;
    };
    filter.iter().all(|(key, condition)| match key.as_str() {
        "AND" => as_list(condition).iter().all(|nested| matches_filter(row, nested)),
        "OR" => as_list(condition).iter().any(|nested| matches_filter(row, nested)),
        "NOT" => as_list(condition).iter().all(|nested| !matches_filter(row, nested)),
        field => matches_condition(row.get(field).unwrap_or(&Value::Null), condition),
    })
}

fn matches_condition(value: &Value, condition: &Value) -> bool {
    let operators = condition.as_object().filter(|map| {
        !map.is_empty() && map.keys().all(|key| FILTER_OPERATORS.contains(&key.as_str()))
    });
    let Some(operators) = operators else {
        return values_equal(value, condition);
    };

    operators.iter().all(|(operator, operand)| {
        let ordering = compare_values(value, operand);
        match operator.as_str() {
            "equals" => values_equal(value, operand),
            "in" => as_list(operand).iter().any(|item| values_equal(value, item)),
            "notIn" => !as_list(operand).iter().any(|item| values_equal(value, item)),
            "not" => !matches_condition(value, operand),
            "lt" => !value.is_null() && ordering == Some(Ordering::Less),
            "lte" => !value.is_null() && matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            "gt" => !value.is_null() && ordering == Some(Ordering::Greater),
            "gte" => !value.is_null() && matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
            "contains" => text_test(value, operand, |text, needle| text.contains(needle)),
            "startsWith" => text_test(value, operand, |text, needle| text.starts_with(needle)),
            "endsWith" => text_test(value, operand, |text, needle| text.ends_with(needle)),
            _ => false,
        }
    })
}

fn text_test(value: &Value, operand: &Value, test: fn(&str, &str) -> bool) -> bool {
    match (value.as_str(), operand.as_str()) {
        (Some(text), Some(needle)) => test(text, needle),
        _ => false,
    }
}

/// Apply `where`, `orderBy`, `skip` and `take` from `args`
fn select_rows(rows: Vec<Row>, args: &Map<String, Value>) -> Vec<Row> {
    let mut rows: Vec<Row> = match args.get("where") {
        Some(filter) => rows.into_iter().filter(|row| matches_filter(row, filter)).collect(),
        None => rows,
    };

    if let Some(order_by) = args.get("orderBy") {
        let keys: Vec<(String, bool)> = as_list(order_by)
            .iter()
            .filter_map(Value::as_object)
            .flat_map(|entry| {
                entry
                    .iter()
                    .map(|(field, direction)| (field.clone(), direction.as_str() == Some("desc")))
                    .collect::<Vec<_>>()
            })
            .collect();
        rows.sort_by(|left, right| {
            for (field, descending) in &keys {
                let ordering = compare_values(
                    left.get(field).unwrap_or(&Value::Null),
                    right.get(field).unwrap_or(&Value::Null),
                )
                .unwrap_or(Ordering::Equal);
                let ordering = if *descending { ordering.reverse() } else { ordering };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    let skip = args.get("skip").and_then(Value::as_u64).unwrap_or(0) as usize;
    let take = args.get("take").and_then(Value::as_u64).map(|take| take as usize);
    rows.into_iter()
        .skip(skip)
        .take(take.unwrap_or(usize::MAX))
        .collect()
}

/// `{ _count: { select: { _all: true, f: true } }, _avg: { select: { f: true } }, ... }`
fn aggregate_rows(rows: &[Row], select: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();

    for (aggregate, requested) in select {
        let fields: Vec<String> = requested
            .get("select")
            .and_then(Value::as_object)
            .map(|select| {
                select
                    .iter()
                    .filter(|(_, value)| is_truthy(value))
                    .map(|(field, _)| field.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut result = Map::new();
        for field in fields {
            let values: Vec<&Value> = rows
                .iter()
                .filter_map(|row| row.get(&field))
                .filter(|value| !value.is_null())
                .collect();

            let computed = match aggregate.as_str() {
                "_count" if field == "_all" => json!(rows.len()),
                "_count" => json!(values.len()),
                "_sum" => sum_values(&values),
                "_avg" => {
                    let numbers: Vec<f64> = values.iter().filter_map(|value| value.as_f64()).collect();
                    if numbers.is_empty() {
                        Value::Null
                    } else {
                        json!(numbers.iter().sum::<f64>() / numbers.len() as f64)
                    }
                }
                "_min" => extreme(&values, Ordering::Less),
                "_max" => extreme(&values, Ordering::Greater),
                _ => continue,
            };
            result.insert(field, computed);
        }
        out.insert(aggregate.clone(), Value::Object(result));
    }

    out
}

fn sum_values(values: &[&Value]) -> Value {
    if values.is_empty() {
        return Value::Null;
    }
    if values.iter().all(|value| value.is_i64()) {
        json!(values.iter().filter_map(|value| value.as_i64()).sum::<i64>())
    } else {
        json!(values.iter().filter_map(|value| value.as_f64()).sum::<f64>())
    }
}

fn extreme(values: &[&Value], wanted: Ordering) -> Value {
    values
        .iter()
        .copied()
        .reduce(|best, candidate| {
            if compare_values(candidate, best) == Some(wanted) {
                candidate
            } else {
                best
            }
        })
        .cloned()
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Arc<ModelCatalog> {
        Arc::new(
            ModelCatalog::from_value(json!({
                "models": [
                    {
                        "name": "User",
                        "fields": [
                            { "name": "id", "kind": "scalar", "type": "Int", "is_id": true, "default": "autoincrement" },
                            { "name": "email", "kind": "scalar", "type": "String", "is_unique": true },
                            { "name": "posts", "kind": "relation", "type": "Post", "is_list": true,
                              "relation": { "name": "UserPosts" } }
                        ]
                    },
                    {
                        "name": "Post",
                        "fields": [
                            { "name": "id", "kind": "scalar", "type": "Int", "is_id": true, "default": "autoincrement" },
                            { "name": "title", "kind": "scalar", "type": "String" },
                            { "name": "views", "kind": "scalar", "type": "Int", "default": { "value": 0 } },
                            { "name": "authorId", "kind": "scalar", "type": "Int", "is_required": false },
                            { "name": "author", "kind": "relation", "type": "User", "is_required": false,
                              "relation": { "name": "UserPosts", "fields": ["authorId"], "references": ["id"] } }
                        ]
                    }
                ]
            }))
            .unwrap(),
        )
    }

    fn request(model: &str, action: ModelAction, args: Value) -> Request {
        Request {
            model: model.to_string(),
            action,
            args,
            data_path: Vec::new(),
            client_method: format!("{}.{}", model.to_lowercase(), action),
            call_site: None,
            transaction: None,
        }
    }

    #[tokio::test]
    async fn test_create_with_nested_posts_and_include() {
        let engine = MemoryEngine::new(catalog());
        let created = engine
            .execute(&request(
                "User",
                ModelAction::Create,
                json!({
                    "data": { "email": "a@b.com", "posts": { "create": [{ "title": "one" }, { "title": "two" }] } },
                    "include": { "posts": true, "_count": true }
                }),
            ))
            .await
            .unwrap();

        let user = &created["createUser"];
        assert_eq!(user["id"], json!(1));
        assert_eq!(user["posts"].as_array().unwrap().len(), 2);
        assert_eq!(user["posts"][0]["authorId"], json!(1));
        assert_eq!(user["_count"], json!({ "posts": 2 }));
        assert_eq!(engine.rows("Post").len(), 2);
    }

    #[tokio::test]
    async fn test_unique_violation_leaves_tables_untouched() {
        let engine = MemoryEngine::new(catalog());
        let create = request("User", ModelAction::Create, json!({ "data": { "email": "a@b.com" } }));
        engine.execute(&create).await.unwrap();

        let error = engine.execute(&create).await.unwrap_err();
        assert_eq!(error.code.as_deref(), Some("P2002"));
        assert_eq!(engine.rows("User").len(), 1);
    }

    #[tokio::test]
    async fn test_update_filters_and_aggregates() {
        let engine = MemoryEngine::new(catalog());
        for (title, views) in [("a", 3), ("b", 5), ("c", 10)] {
            engine
                .execute(&request(
                    "Post",
                    ModelAction::Create,
                    json!({ "data": { "title": title, "views": views } }),
                ))
                .await
                .unwrap();
        }

        let updated = engine
            .execute(&request(
                "Post",
                ModelAction::Update,
                json!({ "where": { "title": "a" }, "data": { "views": { "increment": 4 } } }),
            ))
            .await
            .unwrap();
        assert_eq!(updated["updatePost"]["views"], json!(7));

        let found = engine
            .execute(&request(
                "Post",
                ModelAction::FindMany,
                json!({ "where": { "views": { "gte": 7 } }, "orderBy": { "views": "desc" }, "select": { "title": true } }),
            ))
            .await
            .unwrap();
        assert_eq!(found["findManyPost"], json!([{ "title": "c" }, { "title": "a" }]));

        let aggregate = engine
            .execute(&request(
                "Post",
                ModelAction::Aggregate,
                json!({ "select": { "_count": { "select": { "_all": true } }, "_sum": { "select": { "views": true } }, "_max": { "select": { "views": true } } } }),
            ))
            .await
            .unwrap();
        assert_eq!(
            aggregate["aggregatePost"],
            json!({ "_count": { "_all": 3 }, "_sum": { "views": 22 }, "_max": { "views": 10 } })
        );

        let missing = engine
            .execute(&request(
                "Post",
                ModelAction::Delete,
                json!({ "where": { "title": "zzz" } }),
            ))
            .await
            .unwrap_err();
        assert_eq!(missing.code.as_deref(), Some("P2025"));
    }

    #[tokio::test]
    async fn test_atomic_batch_rolls_back_on_member_failure() {
        let engine = MemoryEngine::new(catalog());
        let first = request("User", ModelAction::Create, json!({ "data": { "email": "x@y.z" } }));
        let duplicate = first.clone();

        let error = engine
            .execute_batch(&[first, duplicate], Some(&BatchTransaction::default()))
            .await
            .unwrap_err();
        assert_eq!(error.code.as_deref(), Some("P2002"));
        assert!(engine.rows("User").is_empty());
    }

    #[tokio::test]
    async fn test_transaction_snapshot_commit_and_rollback() {
        let engine = MemoryEngine::new(catalog());
        let tx = engine.start_transaction(&TransactionOptions::default()).await.unwrap();

        let mut create = request("User", ModelAction::Create, json!({ "data": { "email": "t@x.y" } }));
        create.transaction = Some(tx.clone());
        engine.execute(&create).await.unwrap();
        assert!(engine.rows("User").is_empty());

        engine.commit_transaction(&tx).await.unwrap();
        assert_eq!(engine.rows("User").len(), 1);
        assert_eq!(engine.open_transactions(), 0);

        let stale = engine.rollback_transaction(&tx).await.unwrap_err();
        assert_eq!(stale.code.as_deref(), Some("P2028"));
    }
}
