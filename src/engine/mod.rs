pub mod memory;
pub mod traits;

pub use memory::{EngineEvent, MemoryEngine};
pub use traits::{BatchResult, Engine, EngineCapabilities};
