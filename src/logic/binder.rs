use crate::error::ClientError;
use crate::logic::aggregates;
use crate::logic::capability::{CompositeObject, Layer, Property};
use crate::logic::coordinator::Coordinator;
use crate::logic::desugar::{desugar_args, validate_selection};
use crate::logic::lazy::LazyRequest;
use crate::logic::pipeline::QueryParams;
use crate::logic::transaction::TransactionContext;
use crate::model::{CallSite, FieldRefs, ModelAction, ModelCatalog, ModelDescriptor, Request};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

/// How user arguments become engine arguments, and how the engine's answer
/// is read back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgsMapper {
    Desugar,
    Aggregate,
    Count,
    GroupBy,
}

impl ArgsMapper {
    pub fn for_action(action: ModelAction) -> Self {
        match action {
            ModelAction::Aggregate => ArgsMapper::Aggregate,
            ModelAction::Count => ArgsMapper::Count,
            ModelAction::GroupBy => ArgsMapper::GroupBy,
            _ => ArgsMapper::Desugar,
        }
    }

    pub fn map(&self, catalog: &ModelCatalog, model: &ModelDescriptor, args: Value) -> Result<Value, ClientError> {
        match self {
            ArgsMapper::Desugar => {
                let args = desugar_args(catalog, model, args);
                validate_selection(catalog, model, &args)?;
                Ok(args)
            }
            ArgsMapper::Aggregate => Ok(aggregates::map_aggregate_args(args)),
            ArgsMapper::Count => Ok(aggregates::map_count_args(args)),
            ArgsMapper::GroupBy => Ok(aggregates::map_group_by_args(args)),
        }
    }

    /// Pick this request's value out of the engine response: the root entry,
    /// then the data path, then the aggregate result shape
    pub fn unpack(&self, params: &QueryParams, root: &str, response: Value) -> Result<Value, ClientError> {
        let data = match response {
            Value::Object(mut entries) => entries.remove(root).unwrap_or(Value::Null),
            _ => Value::Null,
        };

        if params.action.is_or_throw() && data.is_null() {
            return Err(ClientError::not_found(format!("No {} found", params.model)));
        }

        let data = params
            .data_path
            .iter()
            .filter(|segment| !matches!(segment.as_str(), "select" | "include"))
            .fold(data, |current, segment| match current {
                Value::Object(mut entries) => entries.remove(segment).unwrap_or(Value::Null),
                _ => Value::Null,
            });

        Ok(match self {
            ArgsMapper::Desugar => data,
            ArgsMapper::Aggregate => aggregates::unpack_aggregate(&params.args, data),
            ArgsMapper::Count => aggregates::unpack_count(&params.args, data),
            ArgsMapper::GroupBy => aggregates::unpack_group_by(&params.args, data),
        })
    }
}

/// One model action bound to a client (and possibly a transaction)
#[derive(Clone)]
pub struct BoundAction {
    model: Arc<ModelDescriptor>,
    action: ModelAction,
    coordinator: Arc<Coordinator>,
    transaction: Option<Arc<TransactionContext>>,
    capture_call_site: bool,
}

impl fmt::Debug for BoundAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoundAction({}.{})", self.model.client_name(), self.action)
    }
}

impl BoundAction {
    pub fn action(&self) -> ModelAction {
        self.action
    }

    pub fn model(&self) -> &str {
        &self.model.name
    }

    pub fn is_fluent(&self) -> bool {
        self.action.is_fluent()
    }

    pub fn is_aggregate(&self) -> bool {
        self.action.is_aggregate()
    }

    /// Build the deferred request. The caller's location is recorded now,
    /// since execution may happen several ticks later.
    #[track_caller]
    pub fn invoke(&self, args: Value) -> LazyRequest {
        let call_site = if self.capture_call_site {
            Some(CallSite::capture())
        } else {
            None
        };
        let args = if args.is_null() { json!({}) } else { args };
        let mapper = ArgsMapper::for_action(self.action);
        let args = match mapper {
            ArgsMapper::Desugar => desugar_args(self.coordinator.catalog(), &self.model, args),
            _ => args,
        };

        let request = Request {
            model: self.model.name.clone(),
            action: self.action,
            args,
            data_path: Vec::new(),
            client_method: format!("{}.{}", self.model.client_name(), self.action),
            call_site,
            transaction: self
                .transaction
                .as_ref()
                .map(|context| context.reference().clone()),
        };

        LazyRequest::new(
            self.coordinator.clone(),
            request,
            mapper,
            self.transaction.clone(),
        )
    }
}

/// Exposes one bound action per supported action name
pub(crate) struct ActionsLayer {
    model: Arc<ModelDescriptor>,
    coordinator: Arc<Coordinator>,
    transaction: Option<Arc<TransactionContext>>,
    capture_call_site: bool,
}

impl ActionsLayer {
    pub(crate) fn new(
        model: Arc<ModelDescriptor>,
        coordinator: Arc<Coordinator>,
        transaction: Option<Arc<TransactionContext>>,
        capture_call_site: bool,
    ) -> Self {
        Self {
            model,
            coordinator,
            transaction,
            capture_call_site,
        }
    }
}

impl Layer for ActionsLayer {
    fn keys(&self) -> Vec<String> {
        self.model
            .action_names()
            .iter()
            .map(|action| action.as_str().to_string())
            .collect()
    }

    fn property(&self, key: &str) -> Option<Property> {
        let action = ModelAction::from_name(key).filter(|action| self.model.supports(*action))?;
        Some(Property::Action(BoundAction {
            model: self.model.clone(),
            action,
            coordinator: self.coordinator.clone(),
            transaction: self.transaction.clone(),
            capture_call_site: self.capture_call_site,
        }))
    }

    fn has(&self, key: &str) -> bool {
        ModelAction::from_name(key).map_or(false, |action| self.model.supports(action))
    }
}

/// The per-model surface: actions, `fields`, extensions and `name`
#[derive(Clone)]
pub struct ModelClient {
    descriptor: Arc<ModelDescriptor>,
    object: CompositeObject,
}

impl ModelClient {
    pub(crate) fn new(descriptor: Arc<ModelDescriptor>, object: CompositeObject) -> Self {
        Self { descriptor, object }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &Arc<ModelDescriptor> {
        &self.descriptor
    }

    pub fn keys(&self) -> Vec<String> {
        self.object.keys()
    }

    /// Absent keys are `None`, never an error
    pub fn get(&self, key: &str) -> Option<Property> {
        self.object.get(key)
    }

    pub fn action(&self, action: ModelAction) -> Option<BoundAction> {
        match self.get(action.as_str())? {
            Property::Action(bound) => Some(bound),
            _ => None,
        }
    }

    /// `None` when the model does not support `action`
    #[track_caller]
    pub fn call(&self, action: ModelAction, args: Value) -> Option<LazyRequest> {
        let bound = self.action(action)?;
        Some(bound.invoke(args))
    }

    pub fn fields(&self) -> Option<Arc<FieldRefs>> {
        match self.get("fields")? {
            Property::Fields(fields) => Some(fields),
            _ => None,
        }
    }
}

impl fmt::Debug for ModelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelClient")
            .field("name", &self.descriptor.name)
            .field("keys", &self.keys())
            .finish()
    }
}
