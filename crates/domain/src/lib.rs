pub mod apply;
pub mod catalog;
pub mod catalog_store;
pub mod compiler;
pub mod error;
pub mod executor;
pub mod idempotency;
pub mod jobs;
pub mod journal;
pub mod lock;
pub mod mutation;
pub mod paths;
pub mod plan;
pub mod ports;
pub mod rules;
pub mod util;
pub mod verify;

pub type DomainResult<T> = Result<T, error::DomainError>;
