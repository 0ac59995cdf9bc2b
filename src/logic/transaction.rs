use crate::error::{ClientError, TransactionErrorKind};
use crate::logic::coordinator::{Arrival, Coordinator};
use crate::logic::pipeline::{EngineCall, EnginePayload, EngineResponse};
use crate::model::{TransactionHandle, TransactionOptions, TransactionRef, TransactionState};
use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A leased engine context. Only one physical call runs against it at a
/// time; queued requests run in creation order.
pub struct TransactionContext {
    reference: TransactionRef,
    handle: Mutex<TransactionHandle>,
    lease: tokio::sync::Mutex<()>,
    queue: Mutex<Vec<Arrival>>,
}

impl TransactionContext {
    fn new(reference: TransactionRef, timeout: Duration) -> Self {
        let started_at = Utc::now();
        let timeout_at = started_at
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let handle = TransactionHandle {
            id: reference.id.clone(),
            state: TransactionState::Active,
            started_at,
            timeout_at,
        };

        Self {
            reference,
            handle: Mutex::new(handle),
            lease: tokio::sync::Mutex::new(()),
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.reference.id
    }

    pub fn reference(&self) -> &TransactionRef {
        &self.reference
    }

    pub fn state(&self) -> TransactionState {
        self.handle.lock().state
    }

    pub fn handle(&self) -> TransactionHandle {
        self.handle.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    fn set_state(&self, state: TransactionState) {
        debug!("Transaction {} -> {:?}", self.reference.id, state);
        self.handle.lock().state = state;
    }

    pub(crate) fn lease(&self) -> &tokio::sync::Mutex<()> {
        &self.lease
    }

    pub(crate) fn enqueue(&self, arrivals: Vec<Arrival>) {
        let mut queue = self.queue.lock();
        queue.extend(arrivals);
        queue.sort_by_key(|arrival| arrival.seq);
    }

    pub(crate) fn next_queued(&self) -> Option<Arrival> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("handle", &self.handle())
            .finish()
    }
}

fn transaction_error(kind: TransactionErrorKind) -> ClientError {
    ClientError::Transaction(kind)
}

/// Lease a context, run `callback` against it and commit or roll back.
///
/// `options` must already carry the configured defaults.
pub(crate) async fn run_interactive<F, Fut, T, E>(
    coordinator: &Arc<Coordinator>,
    options: TransactionOptions,
    callback: F,
) -> Result<T, E>
where
    F: FnOnce(Arc<TransactionContext>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<ClientError>,
{
    if !coordinator.capabilities().supports_interactive_transactions {
        return Err(transaction_error(TransactionErrorKind::Unsupported(
            "the engine does not support interactive transactions".to_string(),
        ))
        .into());
    }

    let max_wait_ms = options.max_wait_ms.unwrap_or_default();
    let timeout_ms = options.timeout_ms.unwrap_or_default();

    // spawned so a lease granted after maxWait can still be released
    let mut start = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.dispatch(EngineCall::StartTransaction(options)).await }
    });
    let reference = match tokio::time::timeout(Duration::from_millis(max_wait_ms), &mut start).await {
        Err(_) => {
            release_late_lease(coordinator.clone(), start);
            return Err(transaction_error(TransactionErrorKind::LeaseTimeout { max_wait_ms }).into());
        }
        Ok(Err(failure)) => {
            return Err(transaction_error(TransactionErrorKind::LeaseFailed(failure.to_string())).into())
        }
        Ok(Ok(Err(failure))) => {
            return Err(transaction_error(TransactionErrorKind::LeaseFailed(failure.to_string())).into())
        }
        Ok(Ok(Ok(EngineResponse {
            payload: EnginePayload::Transaction(reference),
            ..
        }))) => reference,
        Ok(Ok(Ok(_))) => {
            return Err(transaction_error(TransactionErrorKind::LeaseFailed(
                "engine did not return a transaction reference".to_string(),
            ))
            .into())
        }
    };

    let timeout = Duration::from_millis(timeout_ms);
    let context = Arc::new(TransactionContext::new(reference, timeout));
    info!("Transaction {} started (timeout {} ms)", context.id(), timeout_ms);

    match tokio::time::timeout(timeout, callback(context.clone())).await {
        Ok(Ok(value)) => match commit(coordinator, &context).await {
            Ok(()) => Ok(value),
            Err(failure) => Err(failure.into()),
        },
        Ok(Err(failure)) => {
            roll_back(coordinator, &context, TransactionState::RolledBack).await;
            Err(failure)
        }
        Err(_) => {
            roll_back(coordinator, &context, TransactionState::TimedOut).await;
            Err(transaction_error(TransactionErrorKind::Timeout { timeout_ms }).into())
        }
    }
}

async fn commit(coordinator: &Coordinator, context: &TransactionContext) -> Result<(), ClientError> {
    context.set_state(TransactionState::Committing);
    let lease = context.lease().lock().await;

    match coordinator
        .dispatch(EngineCall::CommitTransaction(context.reference().clone()))
        .await
    {
        Ok(_) => {
            context.set_state(TransactionState::Committed);
            info!("Transaction {} committed", context.id());
            Ok(())
        }
        Err(failure) => {
            error!("Commit of transaction {} failed: {}", context.id(), failure);
            drop(lease);
            roll_back(coordinator, context, TransactionState::RolledBack).await;
            Err(transaction_error(TransactionErrorKind::CommitFailed(failure.to_string())))
        }
    }
}

/// Roll back a context the engine granted after the caller stopped waiting
fn release_late_lease(coordinator: Arc<Coordinator>, start: JoinHandle<Result<EngineResponse, ClientError>>) {
    tokio::spawn(async move {
        if let Ok(Ok(EngineResponse {
            payload: EnginePayload::Transaction(reference),
            ..
        })) = start.await
        {
            warn!("Transaction {} was granted after maxWait elapsed, rolling it back", reference.id);
            if let Err(failure) = coordinator
                .dispatch(EngineCall::RollbackTransaction(reference.clone()))
                .await
            {
                error!("Rollback of transaction {} failed: {}", reference.id, failure);
            }
        }
    });
}

/// Best effort: a failing rollback is logged and swallowed
async fn roll_back(coordinator: &Coordinator, context: &TransactionContext, outcome: TransactionState) {
    context.set_state(TransactionState::RollingBack);
    let _lease = context.lease().lock().await;

    match coordinator
        .dispatch(EngineCall::RollbackTransaction(context.reference().clone()))
        .await
    {
        Ok(_) => info!("Transaction {} rolled back", context.id()),
        Err(failure) => error!("Rollback of transaction {} failed: {}", context.id(), failure),
    }
    context.set_state(outcome);
}
