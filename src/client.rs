use crate::config::ClientConfig;
use crate::engine::Engine;
use crate::error::{ClientError, TransactionErrorKind};
use crate::logic::binder::{ActionsLayer, ModelClient};
use crate::logic::capability::{
    CachedLayer, CompositeObject, ComputedLayer, ConstLayer, Layer, ObjectLayer, Property,
};
use crate::logic::coordinator::Coordinator;
use crate::logic::lazy::{LazyRequest, RequestState};
use crate::logic::pipeline::{
    EngineCall, EngineResponse, FnInterceptor, Interceptor, Next, Pipeline, QueryParams,
};
use crate::logic::transaction::{run_interactive, TransactionContext};
use crate::model::{
    BatchTransaction, FieldRefs, ModelCatalog, TransactionHandle, TransactionOptions,
};
use log::{info, warn};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

struct ClientInner {
    coordinator: Arc<Coordinator>,
    config: ClientConfig,
    /// Per-model layers shared by every client view, so memoized values stay stable
    surfaces: HashMap<String, Vec<Arc<dyn Layer>>>,
}

/// Entry point for issuing model operations. Cheap to clone; a clone handed
/// to a transaction callback routes everything through that transaction.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    transaction: Option<Arc<TransactionContext>>,
}

impl Client {
    pub fn builder(catalog: Arc<ModelCatalog>, engine: Arc<dyn Engine>) -> ClientBuilder {
        ClientBuilder::new(catalog, engine)
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        self.inner.coordinator.catalog()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn models(&self) -> Vec<String> {
        self.catalog().list_models()
    }

    /// Look a model up by schema name (`User`) or client name (`user`)
    pub fn model(&self, name: &str) -> Option<ModelClient> {
        let catalog = self.catalog();
        let descriptor = catalog.get_model(name).or_else(|| {
            catalog
                .models()
                .find(|model| model.client_name() == name)
                .cloned()
        })?;

        let actions: Arc<dyn Layer> = Arc::new(ActionsLayer::new(
            descriptor.clone(),
            self.inner.coordinator.clone(),
            self.transaction.clone(),
            self.inner.config.captures_call_sites(),
        ));
        let mut layers = vec![actions];
        if let Some(surface) = self.inner.surfaces.get(&descriptor.name) {
            layers.extend(surface.iter().cloned());
        }

        Some(ModelClient::new(descriptor, CompositeObject::new(layers)))
    }

    /// Connect eagerly; otherwise the first physical call connects
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.inner.coordinator.connect().await
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.inner.coordinator.disconnect().await
    }

    /// Send every scheduled request. Must be called within a Tokio runtime.
    pub fn flush(&self) {
        self.inner.coordinator.flush();
    }

    /// Requests scheduled and waiting for a flush
    pub fn pending(&self) -> usize {
        self.inner.coordinator.pending()
    }

    pub fn is_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn transaction_handle(&self) -> Option<TransactionHandle> {
        self.transaction.as_ref().map(|context| context.handle())
    }

    /// Run `callback` inside an interactive transaction. It receives a client
    /// bound to the transaction; returning `Ok` commits, `Err` or running past
    /// the timeout rolls back.
    pub async fn transaction<F, Fut, T, E>(&self, options: TransactionOptions, callback: F) -> Result<T, E>
    where
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ClientError>,
    {
        if self.transaction.is_some() {
            return Err(ClientError::Transaction(TransactionErrorKind::Nested).into());
        }

        let options = self.inner.config.transaction.resolve(&options);
        let inner = self.inner.clone();
        run_interactive(&self.inner.coordinator, options, move |context| {
            callback(Client {
                inner,
                transaction: Some(context),
            })
        })
        .await
    }

    /// Run requests that have not been observed yet as one atomic unit.
    ///
    /// Uses a single batch call when the engine batches, otherwise an
    /// interactive transaction executing them in order.
    pub async fn transaction_batch(
        &self,
        requests: Vec<LazyRequest>,
        options: TransactionOptions,
    ) -> Result<Vec<Value>, ClientError> {
        if self.transaction.is_some() {
            return Err(ClientError::Transaction(TransactionErrorKind::Nested));
        }
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        for request in &requests {
            if request.state() != RequestState::Created || request.shared().transaction.is_some() {
                return Err(ClientError::validation(format!(
                    "`{}` was already scheduled or belongs to a transaction and cannot join a batch transaction",
                    request.request().client_method
                )));
            }
        }

        let capabilities = self.inner.coordinator.capabilities();
        if capabilities.supports_batching {
            let catalog = self.catalog();
            for request in &requests {
                let shared = request.shared();
                shared
                    .wire_request(catalog, &shared.query_params(true))
                    .map_err(|error| error.with_context(&shared.error_context()))?;
            }

            let entries: Vec<_> = requests.iter().map(|request| request.shared().clone()).collect();
            for entry in &entries {
                entry.try_schedule();
            }

            let options = self.inner.config.transaction.resolve(&options);
            info!("Submitting {} request(s) as a batch transaction", entries.len());
            self.inner.coordinator.submit_atomic(
                entries.clone(),
                BatchTransaction {
                    isolation_level: options.isolation_level,
                },
            );

            let mut values = Vec::with_capacity(entries.len());
            for entry in &entries {
                values.push(entry.wait().await?);
            }
            return Ok(values);
        }

        if capabilities.supports_interactive_transactions {
            return self
                .transaction(options, move |client: Client| async move {
                    let Some(context) = client.transaction.clone() else {
                        return Err::<Vec<Value>, ClientError>(ClientError::unknown(
                            "transaction client without a transaction",
                        ));
                    };
                    let mut values = Vec::with_capacity(requests.len());
                    for request in requests {
                        values.push(request.rebind(context.clone()).await?);
                    }
                    Ok(values)
                })
                .await;
        }

        Err(ClientError::Transaction(TransactionErrorKind::Unsupported(
            "the engine supports neither batching nor interactive transactions".to_string(),
        )))
    }
}

/// Collects configuration, interceptors and model extensions. Interceptors
/// can only be added here, so a built client's chains never change.
pub struct ClientBuilder {
    catalog: Arc<ModelCatalog>,
    engine: Arc<dyn Engine>,
    config: ClientConfig,
    queries: Vec<Arc<dyn Interceptor<QueryParams, Value>>>,
    engines: Vec<Arc<dyn Interceptor<EngineCall, EngineResponse>>>,
    extensions: HashMap<String, Map<String, Value>>,
}

impl ClientBuilder {
    pub fn new(catalog: Arc<ModelCatalog>, engine: Arc<dyn Engine>) -> Self {
        Self {
            catalog,
            engine,
            config: ClientConfig::default(),
            queries: Vec::new(),
            engines: Vec::new(),
            extensions: HashMap::new(),
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Wrap every logical operation
    pub fn use_query<F, Fut>(self, interceptor: F) -> Self
    where
        F: Fn(QueryParams, Next<QueryParams, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ClientError>> + Send + 'static,
    {
        self.query_interceptor(Arc::new(FnInterceptor(interceptor)))
    }

    /// Wrap every physical engine call
    pub fn use_engine<F, Fut>(self, interceptor: F) -> Self
    where
        F: Fn(EngineCall, Next<EngineCall, EngineResponse>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<EngineResponse, ClientError>> + Send + 'static,
    {
        self.engine_interceptor(Arc::new(FnInterceptor(interceptor)))
    }

    pub fn query_interceptor(mut self, interceptor: Arc<dyn Interceptor<QueryParams, Value>>) -> Self {
        self.queries.push(interceptor);
        self
    }

    pub fn engine_interceptor(mut self, interceptor: Arc<dyn Interceptor<EngineCall, EngineResponse>>) -> Self {
        self.engines.push(interceptor);
        self
    }

    /// Add properties to a model's surface. They override `fields` but not
    /// `name`/`$name`.
    pub fn extend_model(mut self, model: impl Into<String>, properties: Map<String, Value>) -> Self {
        self.extensions.entry(model.into()).or_default().extend(properties);
        self
    }

    pub fn build(mut self) -> Client {
        let mut surfaces = HashMap::new();
        for model in self.catalog.models() {
            let descriptor = model.clone();
            let fields = ComputedLayer::new(vec!["fields".to_string()], move |_key: &str| {
                Some(Property::Fields(Arc::new(FieldRefs::for_model(&descriptor))))
            });

            let mut layers: Vec<Arc<dyn Layer>> = vec![Arc::new(CachedLayer::new(Arc::new(fields)))];
            if let Some(extension) = self.extensions.remove(&model.name) {
                layers.push(Arc::new(ObjectLayer::new(extension)));
            }
            layers.push(Arc::new(ConstLayer::new("name", Property::Value(json!(model.name)))));
            layers.push(Arc::new(ConstLayer::new("$name", Property::Value(json!(model.name)))));
            surfaces.insert(model.name.clone(), layers);
        }
        for unknown in self.extensions.keys() {
            warn!("Ignoring extension for unknown model `{}`", unknown);
        }

        info!(
            "Client ready: {} model(s), {} query interceptor(s), {} engine interceptor(s), {:?} scheduling",
            surfaces.len(),
            self.queries.len(),
            self.engines.len(),
            self.config.scheduling
        );

        let coordinator = Coordinator::new(
            self.catalog,
            self.engine,
            Pipeline::new(self.queries),
            Pipeline::new(self.engines),
            &self.config,
        );

        Client {
            inner: Arc::new(ClientInner {
                coordinator: Arc::new(coordinator),
                config: self.config,
                surfaces,
            }),
            transaction: None,
        }
    }
}
