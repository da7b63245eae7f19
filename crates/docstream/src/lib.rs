//! Shared document-store connections and lazy record cursors.
//!
//! Sits between an application's record streams and a document-store
//! driver:
//! - **pool**: one physical client per address, shared by every logical
//!   connection, connected lazily, reference-counted, retried on connect
//!   timeouts, and closed after an idle delay
//! - **connection**: logical connections (address + collection) with the
//!   open/done lease contract
//! - **cursor**: save, remove and pull-based load over a logical connection
//! - **ident**: `id` ⇄ `_id` translation between records and documents
//! - **driver**: the traits a document-store driver implements
//! - **memory**: in-process driver for tests
//! - **mongo**: driver over the `mongodb` crate (feature `mongodb`)
//!
//! ```no_run
//! # async fn run() -> docstream::Result<()> {
//! use std::sync::Arc;
//! use docstream::{ConnectOptions, ConnectionPool, memory::MemoryDriver};
//!
//! let pool = ConnectionPool::new(Arc::new(MemoryDriver::new()));
//! let conn = pool.connect("mem://app", ConnectOptions::new("events"))?;
//!
//! let mut record = serde_json::Map::new();
//! record.insert("hello".into(), "world".into());
//! conn.cursor().save(&mut record).await?;
//!
//! let records = conn.cursor().to_vec().await?;
//! assert_eq!(records.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod cursor;
pub mod driver;
pub mod error;
pub mod ident;
pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;
pub mod pool;

pub use config::ConnectOptions;
pub use connection::{CollectionLease, LogicalConnection};
pub use cursor::Cursor;
pub use driver::{SortDirection, is_transient_timeout};
pub use error::{Error, Result};
pub use ident::Record;
pub use pool::{Checkout, ConnectionPool, PoolStats};
