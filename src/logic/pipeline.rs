use crate::engine::BatchResult;
use crate::error::ClientError;
use crate::model::{BatchTransaction, ModelAction, Request, TransactionOptions, TransactionRef};
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The step an interceptor chain ends in
pub type Terminal<P, R> = Arc<dyn Fn(P) -> BoxFuture<'static, Result<R, ClientError>> + Send + Sync>;

/// Wraps the rest of the chain. `next` may be run at most once; not running it
/// short-circuits everything after this interceptor.
#[async_trait::async_trait]
pub trait Interceptor<P, R>: Send + Sync {
    async fn intercept(&self, params: P, next: Next<P, R>) -> Result<R, ClientError>;
}

/// Continuation handed to an interceptor
pub struct Next<P, R> {
    chain: Arc<[Arc<dyn Interceptor<P, R>>]>,
    index: usize,
    terminal: Terminal<P, R>,
    called: AtomicBool,
}

impl<P, R> Next<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    pub async fn run(&self, params: P) -> Result<R, ClientError> {
        if self.called.swap(true, Ordering::SeqCst) {
            return Err(ClientError::InterceptorMisuse {
                message: format!(
                    "interceptor {} called next more than once",
                    self.index.saturating_sub(1)
                ),
            });
        }
        step(self.chain.clone(), self.index, params, self.terminal.clone()).await
    }
}

fn step<P, R>(
    chain: Arc<[Arc<dyn Interceptor<P, R>>]>,
    index: usize,
    params: P,
    terminal: Terminal<P, R>,
) -> BoxFuture<'static, Result<R, ClientError>>
where
    P: Send + 'static,
    R: Send + 'static,
{
    match chain.get(index).cloned() {
        Some(interceptor) => {
            let next = Next {
                chain,
                index: index + 1,
                terminal,
                called: AtomicBool::new(false),
            };
            Box::pin(async move { interceptor.intercept(params, next).await })
        }
        None => terminal(params),
    }
}

/// Adapts an async closure into an [`Interceptor`]
pub struct FnInterceptor<F>(pub F);

#[async_trait::async_trait]
impl<P, R, F, Fut> Interceptor<P, R> for FnInterceptor<F>
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(P, Next<P, R>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, ClientError>> + Send + 'static,
{
    async fn intercept(&self, params: P, next: Next<P, R>) -> Result<R, ClientError> {
        (self.0)(params, next).await
    }
}

/// An ordered, fixed interceptor chain. The first registered interceptor is
/// the outermost layer.
pub struct Pipeline<P, R> {
    interceptors: Arc<[Arc<dyn Interceptor<P, R>>]>,
}

impl<P, R> Clone for Pipeline<P, R> {
    fn clone(&self) -> Self {
        Self {
            interceptors: self.interceptors.clone(),
        }
    }
}

impl<P, R> Pipeline<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    pub fn new(interceptors: Vec<Arc<dyn Interceptor<P, R>>>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn run(&self, params: P, terminal: Terminal<P, R>) -> BoxFuture<'static, Result<R, ClientError>> {
        step(self.interceptors.clone(), 0, params, terminal)
    }
}

/// What a query interceptor sees of one logical operation
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParams {
    pub model: String,
    pub action: ModelAction,
    pub args: Value,
    pub data_path: Vec<String>,
    pub run_in_transaction: bool,
    /// Cleared by an interceptor to keep this request out of a shared batch
    pub batchable: bool,
}

/// One physical call to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Execute(Request),
    Batch {
        requests: Vec<Request>,
        transaction: Option<BatchTransaction>,
    },
    StartTransaction(TransactionOptions),
    CommitTransaction(TransactionRef),
    RollbackTransaction(TransactionRef),
}

impl EngineCall {
    pub fn name(&self) -> &'static str {
        match self {
            EngineCall::Execute(_) => "execute",
            EngineCall::Batch { .. } => "batch",
            EngineCall::StartTransaction(_) => "startTransaction",
            EngineCall::CommitTransaction(_) => "commitTransaction",
            EngineCall::RollbackTransaction(_) => "rollbackTransaction",
        }
    }

    /// Calls that may be re-issued after a transient failure. Anything bound
    /// to a leased context is excluded.
    pub fn is_retry_eligible(&self) -> bool {
        match self {
            EngineCall::Execute(request) => request.transaction.is_none(),
            EngineCall::Batch { .. } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePayload {
    Data(Value),
    Batch(BatchResult),
    Transaction(TransactionRef),
    Closed,
}

/// What an engine interceptor gets back from `next`
#[derive(Debug, Clone, PartialEq)]
pub struct EngineResponse {
    pub payload: EnginePayload,
    pub elapsed: Duration,
}
