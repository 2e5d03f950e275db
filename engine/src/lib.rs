pub mod dataset;
pub mod error;
pub mod graph;
pub mod scope;
pub mod session;
pub mod tensor;

pub use dataset::{Dataset, Element};
pub use error::{EngineErr, Result};
pub use graph::{Collection, Counter, DeviceFn, Graph, IteratorHandle, Op, Output, Variable};
pub use scope::Scope;
pub use session::{Session, Snapshot};
pub use tensor::Tensor;
