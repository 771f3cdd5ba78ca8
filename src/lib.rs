pub mod adapter;
pub mod algorithm;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod launch;
pub mod message;
pub mod model;
mod pool;
pub mod process;
pub mod protocol;
pub mod request;
pub mod result;
pub mod thread_worker;
pub mod worker;

#[cfg(test)]
mod testutil;

pub use config::{EngineConfig, EngineConfigBuilder, Recycle};
pub use context::{Engine, EvalHandle};
pub use dispatcher::Dispatcher;
pub use error::{Error, EvalError, ProtocolError};
pub use request::{Outcome, RequestId, RequestState};
