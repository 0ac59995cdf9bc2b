use crate::config::{ClientConfig, SchedulingPolicy};
use crate::engine::{Engine, EngineCapabilities};
use crate::error::{ClientError, EngineError, TransactionErrorKind};
use crate::logic::lazy::{LazyShared, RequestState};
use crate::logic::pipeline::{
    EngineCall, EnginePayload, EngineResponse, Pipeline, QueryParams, Terminal,
};
use crate::logic::transaction::TransactionContext;
use crate::model::{BatchTransaction, ModelCatalog, Request};
use futures::future::{join_all, BoxFuture};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

/// Every physical engine call goes through here: lazy connection, engine
/// interceptors and the single transient retry.
pub(crate) struct Dispatcher {
    engine: Arc<dyn Engine>,
    pipeline: Pipeline<EngineCall, EngineResponse>,
    terminal: Terminal<EngineCall, EngineResponse>,
    retry_transient: bool,
    connected: AtomicBool,
    connecting: tokio::sync::Mutex<()>,
}

impl Dispatcher {
    fn new(engine: Arc<dyn Engine>, pipeline: Pipeline<EngineCall, EngineResponse>, retry_transient: bool) -> Self {
        let physical_engine = engine.clone();
        let terminal: Terminal<EngineCall, EngineResponse> = Arc::new(move |call: EngineCall| -> BoxFuture<'static, Result<EngineResponse, ClientError>> {
            let engine = physical_engine.clone();
            Box::pin(async move { physical(engine, call).await })
        });

        Self {
            engine,
            pipeline,
            terminal,
            retry_transient,
            connected: AtomicBool::new(false),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    async fn connect(&self) -> Result<(), ClientError> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.connecting.lock().await;
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        info!("Connecting to engine");
        self.engine
            .connect()
            .await
            .map_err(|error| ClientError::Initialization {
                message: error.message,
                code: error.code,
            })?;
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        let _guard = self.connecting.lock().await;
        if self.connected.swap(false, Ordering::AcqRel) {
            info!("Disconnecting from engine");
            self.engine.disconnect().await?;
        }
        Ok(())
    }

    /// Each attempt, the retry included, runs through the engine interceptors
    async fn call(&self, call: EngineCall) -> Result<EngineResponse, ClientError> {
        self.connect().await?;

        let retry = (self.retry_transient && call.is_retry_eligible()).then(|| call.clone());
        let outcome = self.pipeline.run(call, self.terminal.clone()).await;

        match (outcome, retry) {
            (Err(error), Some(call)) if self.is_transient(&error) => {
                warn!("Engine {} failed with a transient error, retrying once: {}", call.name(), error);
                self.pipeline.run(call, self.terminal.clone()).await
            }
            (outcome, _) => outcome,
        }
    }

    fn is_transient(&self, error: &ClientError) -> bool {
        error
            .engine_error()
            .map(|error| self.engine.is_retryable(&error))
            .unwrap_or(false)
    }
}

async fn physical(engine: Arc<dyn Engine>, call: EngineCall) -> Result<EngineResponse, ClientError> {
    let started = Instant::now();
    let outcome = invoke(engine.as_ref(), &call).await;

    let elapsed = started.elapsed();
    debug!("Engine {} finished in {:?}", call.name(), elapsed);
    Ok(EngineResponse {
        payload: outcome?,
        elapsed,
    })
}

async fn invoke(engine: &dyn Engine, call: &EngineCall) -> Result<EnginePayload, EngineError> {
    match call {
        EngineCall::Execute(request) => engine.execute(request).await.map(EnginePayload::Data),
        EngineCall::Batch {
            requests,
            transaction,
        } => engine
            .execute_batch(requests, transaction.as_ref())
            .await
            .map(EnginePayload::Batch),
        EngineCall::StartTransaction(options) => engine
            .start_transaction(options)
            .await
            .map(EnginePayload::Transaction),
        EngineCall::CommitTransaction(transaction) => engine
            .commit_transaction(transaction)
            .await
            .map(|_| EnginePayload::Closed),
        EngineCall::RollbackTransaction(transaction) => engine
            .rollback_transaction(transaction)
            .await
            .map(|_| EnginePayload::Closed),
    }
}

/// A request that reached the end of its interceptor chain and waits for
/// its group to be sent
pub(crate) struct Arrival {
    pub(crate) seq: u64,
    pub(crate) request: Request,
    pub(crate) reply: oneshot::Sender<Result<Value, ClientError>>,
}

#[derive(Clone)]
enum Route {
    Standalone,
    Batch,
    Atomic(BatchTransaction),
    Interactive(Arc<TransactionContext>),
}

enum Group {
    Batch(Vec<Arrival>),
    Atomic(BatchTransaction, Vec<Arrival>),
    Interactive(Arc<TransactionContext>, Vec<Arrival>),
}

#[derive(Clone)]
enum FlushMode {
    Scheduled,
    Atomic(BatchTransaction),
}

#[derive(Default)]
struct Collected {
    fired: bool,
    batch: Vec<Arrival>,
    atomic: Option<(BatchTransaction, Vec<Arrival>)>,
    interactive: Vec<(Arc<TransactionContext>, Vec<Arrival>)>,
}

impl Collected {
    fn push(&mut self, route: Route, arrival: Arrival) {
        match route {
            Route::Standalone | Route::Batch => self.batch.push(arrival),
            Route::Atomic(transaction) => self
                .atomic
                .get_or_insert_with(|| (transaction, Vec::new()))
                .1
                .push(arrival),
            Route::Interactive(context) => {
                match self
                    .interactive
                    .iter_mut()
                    .find(|(existing, _)| Arc::ptr_eq(existing, &context))
                {
                    Some((_, arrivals)) => arrivals.push(arrival),
                    None => self.interactive.push((context, vec![arrival])),
                }
            }
        }
    }

    fn fire(&mut self) -> Vec<Group> {
        self.fired = true;
        let mut groups = Vec::new();
        if !self.batch.is_empty() {
            groups.push(Group::Batch(std::mem::take(&mut self.batch)));
        }
        if let Some((transaction, arrivals)) = self.atomic.take() {
            groups.push(Group::Atomic(transaction, arrivals));
        }
        for (context, arrivals) in self.interactive.drain(..) {
            groups.push(Group::Interactive(context, arrivals));
        }
        groups
    }
}

/// Holds back every request of one flush until all of them have either
/// reached their terminal or left the chain, so siblings can share a batch.
struct Barrier {
    remaining: AtomicUsize,
    collected: Mutex<Collected>,
}

/// Tracks whether one entry has been counted against its barrier
struct Slot {
    barrier: Arc<Barrier>,
    counted: AtomicBool,
}

/// Drives lazy requests from the pending queue to the engine
pub struct Coordinator {
    catalog: Arc<ModelCatalog>,
    dispatcher: Dispatcher,
    queries: Pipeline<QueryParams, Value>,
    scheduling: SchedulingPolicy,
    pending: Mutex<Vec<Arc<LazyShared>>>,
    sequence: AtomicU64,
}

impl Coordinator {
    pub(crate) fn new(
        catalog: Arc<ModelCatalog>,
        engine: Arc<dyn Engine>,
        queries: Pipeline<QueryParams, Value>,
        engines: Pipeline<EngineCall, EngineResponse>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            catalog,
            dispatcher: Dispatcher::new(engine, engines, config.retry.transient),
            queries,
            scheduling: config.scheduling,
            pending: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn capabilities(&self) -> EngineCapabilities {
        self.dispatcher.engine.capabilities()
    }

    pub fn scheduling(&self) -> SchedulingPolicy {
        self.scheduling
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Queue `entry` for the next flush. Under `Batched` the first entry of an
    /// empty queue spawns that flush, so it happens whether or not anyone
    /// keeps polling the result.
    pub(crate) fn enqueue(self: &Arc<Self>, entry: Arc<LazyShared>) {
        let first = {
            let mut pending = self.pending.lock();
            pending.push(entry);
            pending.len() == 1
        };

        if first && self.scheduling == SchedulingPolicy::Batched {
            // outside a runtime the queue waits for an explicit flush
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let coordinator = self.clone();
                runtime.spawn(async move {
                    tokio::task::yield_now().await;
                    coordinator.flush();
                });
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub(crate) async fn connect(&self) -> Result<(), ClientError> {
        self.dispatcher.connect().await
    }

    pub(crate) async fn disconnect(&self) -> Result<(), ClientError> {
        self.dispatcher.disconnect().await
    }

    /// One physical call through the engine interceptors
    pub(crate) async fn dispatch(&self, call: EngineCall) -> Result<EngineResponse, ClientError> {
        self.dispatcher.call(call).await
    }

    /// Hand every scheduled request to a background task. Must be called
    /// within a Tokio runtime.
    pub fn flush(self: &Arc<Self>) {
        let entries = std::mem::take(&mut *self.pending.lock());
        if entries.is_empty() {
            return;
        }
        tokio::spawn(self.clone().process(entries, FlushMode::Scheduled));
    }

    /// Send `entries` as one atomic multi-request call
    pub(crate) fn submit_atomic(self: &Arc<Self>, entries: Vec<Arc<LazyShared>>, transaction: BatchTransaction) {
        tokio::spawn(self.clone().process(entries, FlushMode::Atomic(transaction)));
    }

    async fn process(self: Arc<Self>, mut entries: Vec<Arc<LazyShared>>, mode: FlushMode) {
        entries.sort_by_key(|entry| entry.seq);
        debug!("Flushing {} request(s)", entries.len());

        let barrier = Arc::new(Barrier {
            remaining: AtomicUsize::new(entries.len()),
            collected: Mutex::new(Collected::default()),
        });

        let runs = entries.into_iter().map(|entry| {
            let slot = Arc::new(Slot {
                barrier: barrier.clone(),
                counted: AtomicBool::new(false),
            });
            self.clone().run_entry(entry, slot, mode.clone())
        });
        join_all(runs).await;
    }

    async fn run_entry(self: Arc<Self>, entry: Arc<LazyShared>, slot: Arc<Slot>, mode: FlushMode) {
        entry.set_state(RequestState::Executing);
        let started = Instant::now();
        let in_transaction = entry.transaction.is_some() || matches!(mode, FlushMode::Atomic(_));
        let params = entry.query_params(in_transaction);

        let terminal: Terminal<QueryParams, Value> = {
            let coordinator = self.clone();
            let entry = entry.clone();
            let slot = slot.clone();
            Arc::new(move |params: QueryParams| -> BoxFuture<'static, Result<Value, ClientError>> {
                let coordinator = coordinator.clone();
                let entry = entry.clone();
                let slot = slot.clone();
                let mode = mode.clone();
                Box::pin(async move { coordinator.terminal(entry, params, slot, mode).await })
            })
        };

        let result = self.queries.run(params, terminal).await;
        // short-circuited or failed before reaching the engine
        self.depart(&slot);

        let result = result.map_err(|error| error.with_context(&entry.error_context()));
        debug!(
            "{} settled in {:?} ({})",
            entry.request.client_method,
            started.elapsed(),
            if result.is_ok() { "ok" } else { "error" }
        );
        entry.settle(result);
    }

    async fn terminal(
        self: Arc<Self>,
        entry: Arc<LazyShared>,
        params: QueryParams,
        slot: Arc<Slot>,
        mode: FlushMode,
    ) -> Result<Value, ClientError> {
        let request = entry.wire_request(&self.catalog, &params)?;
        let root = request.root_name();

        let route = match (mode, &entry.transaction) {
            (FlushMode::Atomic(transaction), _) => Route::Atomic(transaction),
            (_, Some(context)) => Route::Interactive(context.clone()),
            _ if params.batchable && self.capabilities().supports_batching => Route::Batch,
            _ => Route::Standalone,
        };

        let raw = match route {
            Route::Standalone => {
                self.depart(&slot);
                self.execute(request).await
            }
            route => {
                let (reply, receiver) = oneshot::channel();
                let arrival = Arrival {
                    seq: entry.seq,
                    request,
                    reply,
                };
                self.arrive(&slot, route, arrival);
                receiver.await.unwrap_or_else(|_| {
                    Err(ClientError::unknown("request was dropped before the engine answered"))
                })
            }
        }?;

        entry.mapper.unpack(&params, &root, raw)
    }

    fn arrive(self: &Arc<Self>, slot: &Slot, route: Route, arrival: Arrival) {
        let late = {
            let mut collected = slot.barrier.collected.lock();
            if collected.fired {
                Some(arrival)
            } else {
                collected.push(route.clone(), arrival);
                None
            }
        };

        match late {
            Some(arrival) => {
                let mut collected = Collected::default();
                collected.push(route, arrival);
                self.launch(collected.fire());
            }
            None => self.depart(slot),
        }
    }

    /// Count the entry against its barrier once; the last one sends every group
    fn depart(self: &Arc<Self>, slot: &Slot) {
        if slot.counted.swap(true, Ordering::SeqCst) {
            return;
        }
        if slot.barrier.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            let groups = slot.barrier.collected.lock().fire();
            self.launch(groups);
        }
    }

    fn launch(self: &Arc<Self>, groups: Vec<Group>) {
        for group in groups {
            match group {
                Group::Batch(arrivals) => {
                    tokio::spawn(self.clone().send_batch(arrivals, None));
                }
                Group::Atomic(transaction, arrivals) => {
                    tokio::spawn(self.clone().send_batch(arrivals, Some(transaction)));
                }
                Group::Interactive(context, arrivals) => {
                    // queue synchronously so the lease sees creation order
                    context.enqueue(arrivals);
                    tokio::spawn(self.clone().drain_transaction(context));
                }
            }
        }
    }

    async fn execute(&self, request: Request) -> Result<Value, ClientError> {
        match self.dispatch(EngineCall::Execute(request)).await?.payload {
            EnginePayload::Data(data) => Ok(data),
            _ => Err(ClientError::unknown("engine returned no data for a single request")),
        }
    }

    async fn send_batch(self: Arc<Self>, mut arrivals: Vec<Arrival>, transaction: Option<BatchTransaction>) {
        arrivals.sort_by_key(|arrival| arrival.seq);

        if transaction.is_none() && arrivals.len() == 1 {
            if let Some(arrival) = arrivals.pop() {
                let result = self.execute(arrival.request).await;
                let _ = arrival.reply.send(result);
            }
            return;
        }

        debug!(
            "Sending {} request(s) as one {} batch",
            arrivals.len(),
            if transaction.is_some() { "atomic" } else { "plain" }
        );
        let requests: Vec<Request> = arrivals.iter().map(|arrival| arrival.request.clone()).collect();
        let outcome = self
            .dispatch(EngineCall::Batch {
                requests,
                transaction,
            })
            .await;

        match outcome {
            Ok(EngineResponse {
                payload: EnginePayload::Batch(results),
                ..
            }) if results.len() == arrivals.len() => {
                for (arrival, result) in arrivals.into_iter().zip(results) {
                    let _ = arrival.reply.send(result.map_err(ClientError::from));
                }
            }
            Ok(EngineResponse { payload, .. }) => {
                let received = match payload {
                    EnginePayload::Batch(results) => results.len(),
                    _ => 0,
                };
                let error = ClientError::unknown(format!(
                    "engine returned {} result(s) for a batch of {} request(s)",
                    received,
                    arrivals.len()
                ));
                broadcast(arrivals, error);
            }
            Err(error) => broadcast(arrivals, error),
        }
    }

    /// Run queued requests of one transaction, one at a time under its lease
    async fn drain_transaction(self: Arc<Self>, context: Arc<TransactionContext>) {
        let _lease = context.lease().lock().await;
        while let Some(arrival) = context.next_queued() {
            let result = if context.is_active() {
                self.execute(arrival.request).await
            } else {
                Err(ClientError::Transaction(TransactionErrorKind::Closed(
                    context.id().to_string(),
                )))
            };
            let _ = arrival.reply.send(result);
        }
    }
}

fn broadcast(arrivals: Vec<Arrival>, error: ClientError) {
    for arrival in arrivals {
        let _ = arrival.reply.send(Err(error.clone()));
    }
}
