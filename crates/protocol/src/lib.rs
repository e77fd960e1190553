//! Wire contract between the orchestration service and its UI clients.

pub mod adjacency;
pub mod chunk;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod request;
pub mod stream;
pub mod validation;

pub use validation::validate;
