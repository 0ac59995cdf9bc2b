pub mod aggregates;
pub mod binder;
pub mod capability;
pub mod coordinator;
pub mod desugar;
pub mod fluent;
pub mod lazy;
pub mod pipeline;
pub mod transaction;

pub use binder::{ArgsMapper, BoundAction, ModelClient};
pub use capability::{
    CachedLayer, CompositeObject, ComputedLayer, ConstLayer, Layer, ObjectLayer, Property,
};
pub use coordinator::Coordinator;
pub use desugar::{desugar_args, validate_selection};
pub use lazy::{LazyRequest, RequestState};
pub use pipeline::{
    EngineCall, EnginePayload, EngineResponse, FnInterceptor, Interceptor, Next, Pipeline,
    QueryParams, Terminal,
};
pub use transaction::TransactionContext;
