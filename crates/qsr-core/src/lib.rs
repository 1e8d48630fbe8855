pub mod circuit_breaker;
pub mod config;
pub mod dlq;
pub mod error;
pub mod graph;
pub mod io;
pub mod locks;
pub mod mutation;
pub mod paths;
pub mod progress;
pub mod services;
pub mod transaction;

pub use error::{CoreError, ErrorKind, Result};
pub use services::Services;
