pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod logic;
pub mod model;

pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, ErrorFormat, RetryConfig, SchedulingPolicy, TransactionConfig};
pub use engine::{BatchResult, Engine, EngineCapabilities, EngineEvent, MemoryEngine};
pub use error::{ClientError, EngineError, EngineErrorKind, ErrorContext, TransactionErrorKind};

pub use logic::{
    BoundAction, EngineCall, EnginePayload, EngineResponse, Interceptor, LazyRequest,
    ModelClient, Next, Property, QueryParams, RequestState, TransactionContext,
};

// Export all model types
pub use model::*;
