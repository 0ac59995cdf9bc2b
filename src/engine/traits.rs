use crate::error::EngineError;
use crate::model::{BatchTransaction, Request, TransactionOptions, TransactionRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a backend declares it can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCapabilities {
    pub supports_batching: bool,
    pub supports_interactive_transactions: bool,
}

impl Default for EngineCapabilities {
    fn default() -> Self {
        Self {
            supports_batching: true,
            supports_interactive_transactions: true,
        }
    }
}

/// Outcome of a multi-request call: one entry per submitted request, same order
pub type BatchResult = Vec<Result<Value, EngineError>>;

/// The query-execution backend (local process, linked library or remote proxy).
///
/// Responses are objects keyed by the request's root name (`findManyUser`).
/// A request carrying a transaction reference must run on that leased context.
#[async_trait::async_trait]
pub trait Engine: Send + Sync {
    fn capabilities(&self) -> EngineCapabilities;

    async fn connect(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn execute(&self, request: &Request) -> Result<Value, EngineError>;

    async fn execute_batch(
        &self,
        requests: &[Request],
        transaction: Option<&BatchTransaction>,
    ) -> Result<BatchResult, EngineError>;

    async fn start_transaction(
        &self,
        options: &TransactionOptions,
    ) -> Result<TransactionRef, EngineError>;

    async fn commit_transaction(&self, transaction: &TransactionRef) -> Result<(), EngineError>;

    async fn rollback_transaction(&self, transaction: &TransactionRef)
        -> Result<(), EngineError>;

    /// Whether a failed call may be re-issued once (e.g. stale connection).
    /// Classification belongs to the backend.
    fn is_retryable(&self, _error: &EngineError) -> bool {
        false
    }
}
