use crate::config::SchedulingPolicy;
use crate::error::{ClientError, ErrorContext};
use crate::logic::binder::ArgsMapper;
use crate::logic::coordinator::Coordinator;
use crate::logic::fluent;
use crate::logic::pipeline::QueryParams;
use crate::logic::transaction::TransactionContext;
use crate::model::{ModelCatalog, Request};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle of a lazy request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestState {
    Created,
    /// Queued for the next flush
    Scheduled,
    Executing,
    Settled,
}

type Settlement = Option<Result<Value, ClientError>>;

/// State shared by every handle to one lazy request
pub(crate) struct LazyShared {
    pub(crate) seq: u64,
    pub(crate) request: Request,
    pub(crate) mapper: ArgsMapper,
    pub(crate) transaction: Option<Arc<TransactionContext>>,
    state: Mutex<RequestState>,
    settled: watch::Sender<Settlement>,
}

impl LazyShared {
    pub(crate) fn state(&self) -> RequestState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: RequestState) {
        *self.state.lock() = state;
    }

    /// Created -> Scheduled. Returns false when the request already left `Created`.
    pub(crate) fn try_schedule(&self) -> bool {
        let mut state = self.state.lock();
        if *state == RequestState::Created {
            *state = RequestState::Scheduled;
            true
        } else {
            false
        }
    }

    pub(crate) fn settle(&self, result: Result<Value, ClientError>) {
        self.set_state(RequestState::Settled);
        self.settled.send_replace(Some(result));
    }

    pub(crate) async fn wait(&self) -> Result<Value, ClientError> {
        let mut receiver = self.settled.subscribe();
        let settled = match receiver.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone(),
            Err(_) => None,
        };
        settled.unwrap_or_else(|| Err(ClientError::unknown("request was dropped before it settled")))
    }

    pub(crate) fn query_params(&self, run_in_transaction: bool) -> QueryParams {
        QueryParams {
            model: self.request.model.clone(),
            action: self.request.action,
            args: self.request.args.clone(),
            data_path: self.request.data_path.clone(),
            run_in_transaction,
            batchable: true,
        }
    }

    /// The request as sent to the engine, rebuilt from what the interceptors passed on
    pub(crate) fn wire_request(&self, catalog: &ModelCatalog, params: &QueryParams) -> Result<Request, ClientError> {
        let model = catalog
            .get_model(&params.model)
            .ok_or_else(|| ClientError::validation(format!("Unknown model `{}`", params.model)))?;
        let args = self.mapper.map(catalog, &model, params.args.clone())?;

        Ok(Request {
            model: params.model.clone(),
            action: params.action,
            args,
            data_path: params.data_path.clone(),
            client_method: self.request.client_method.clone(),
            call_site: self.request.call_site,
            transaction: self.request.transaction.clone(),
        })
    }

    pub(crate) fn error_context(&self) -> ErrorContext {
        ErrorContext {
            client_method: Some(self.request.client_method.clone()),
            data_path: self.request.data_path.clone(),
            call_site: self.request.call_site,
        }
    }
}

/// A deferred database operation. Nothing is sent until the request is
/// awaited, observed through [`LazyRequest::result`] or scheduled and flushed.
/// The settled result is memoized, so every clone observes the same value.
#[must_use = "lazy requests do nothing until awaited or scheduled"]
#[derive(Clone)]
pub struct LazyRequest {
    shared: Arc<LazyShared>,
    coordinator: Arc<Coordinator>,
}

impl LazyRequest {
    pub(crate) fn new(
        coordinator: Arc<Coordinator>,
        request: Request,
        mapper: ArgsMapper,
        transaction: Option<Arc<TransactionContext>>,
    ) -> Self {
        let (settled, _) = watch::channel(None);
        let shared = LazyShared {
            seq: coordinator.next_sequence(),
            request,
            mapper,
            transaction,
            state: Mutex::new(RequestState::Created),
            settled,
        };
        Self {
            shared: Arc::new(shared),
            coordinator,
        }
    }

    pub fn request(&self) -> &Request {
        &self.shared.request
    }

    pub fn state(&self) -> RequestState {
        self.shared.state()
    }

    /// Creation order across the client
    pub fn sequence(&self) -> u64 {
        self.shared.seq
    }

    /// Queue the request without waiting for it. It runs on the next flush,
    /// either explicit ([`Client::flush`](crate::Client::flush)) or the one
    /// the batched policy spawns once the current turn yields.
    pub fn schedule(&self) -> bool {
        if self.shared.try_schedule() {
            self.coordinator.enqueue(self.shared.clone());
            true
        } else {
            false
        }
    }

    /// Observe the result, scheduling the request first if needed
    pub async fn result(&self) -> Result<Value, ClientError> {
        self.schedule();

        if self.shared.state() == RequestState::Scheduled {
            // let siblings observed in the same turn join the queue; the
            // flush spawned by `schedule` does not depend on this future
            if self.coordinator.scheduling() == SchedulingPolicy::Batched {
                tokio::task::yield_now().await;
            }
            self.coordinator.flush();
        }

        self.shared.wait().await
    }

    /// Chain into a relation of the record this request returns. The parent
    /// is folded into the new request's selection and never runs separately.
    pub fn fluent(&self, relation: &str, args: Option<Value>) -> Option<LazyRequest> {
        let request = fluent::chain(self.coordinator.catalog(), &self.shared.request, relation, args)?;
        Some(LazyRequest::new(
            self.coordinator.clone(),
            request,
            self.shared.mapper,
            self.shared.transaction.clone(),
        ))
    }

    pub(crate) fn shared(&self) -> &Arc<LazyShared> {
        &self.shared
    }

    /// A fresh, unscheduled copy bound to an interactive transaction
    pub(crate) fn rebind(&self, transaction: Arc<TransactionContext>) -> LazyRequest {
        let mut request = self.shared.request.clone();
        request.transaction = Some(transaction.reference().clone());
        LazyRequest::new(
            self.coordinator.clone(),
            request,
            self.shared.mapper,
            Some(transaction),
        )
    }
}

impl std::fmt::Debug for LazyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyRequest")
            .field("seq", &self.shared.seq)
            .field("client_method", &self.shared.request.client_method)
            .field("state", &self.state())
            .finish()
    }
}

impl IntoFuture for LazyRequest {
    type Output = Result<Value, ClientError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.result().await })
    }
}
