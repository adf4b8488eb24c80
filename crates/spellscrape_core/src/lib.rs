pub mod catalog;
pub mod config;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod layout;
pub mod persist;
pub mod rename;
pub mod runtime;
pub mod transcode;

pub use error::{ErrorKind, FailurePolicy, IngestError};
