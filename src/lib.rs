//! docwire: a document-database wire protocol gateway backed by PostgreSQL
//! or SQLite.

pub mod backend;
pub mod bson;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod query;
pub mod storage;
pub mod wire;

pub use bson::{Bson, Document, ObjectId};
pub use config::Config;
pub use error::{CommandError, CommandResult, ErrorCode, ErrorKind};
pub use handlers::{Context, Dispatcher, Registry, Request, Session, Settings};
pub use storage::{Namespace, Storage, StorageConfig, StorageError, StorageResult};
pub use wire::Listener;
