//! Parallel single-table copy between databases.
//!
//! `rowpipe` copies every row of one source table into a destination
//! table, possibly on a different engine, in a single one-shot run. The
//! copy set is pinned up front by capturing the physical row identifier
//! (`ctid`) of every matching source row with one key query; workers then
//! fetch and insert strictly by those identifiers, in parallel, each on
//! its own pair of pooled connections.
//!
//! # Example
//!
//! ```no_run
//! use rowpipe::{Config, CopyEngine};
//!
//! # async fn run() -> rowpipe::Result<()> {
//! let config = Config::load("copy.yaml")?;
//! let summary = CopyEngine::new(config).run().await?;
//! println!(
//!     "copied {} of {} rows with {} workers",
//!     summary.rows_copied, summary.row_count, summary.degree
//! );
//! # Ok(())
//! # }
//! ```

pub mod column;
pub mod config;
pub mod dest;
pub mod engine;
pub mod error;
pub mod pool;
pub mod rowid;
pub mod table;
pub mod value;

pub use column::{ColumnDescriptor, ColumnKind};
pub use config::{Config, CopyConfig, EndpointConfig, StoreBackend};
pub use engine::{CopyEngine, CopySummary, WorkerReport, MAX_BIND_ROWS};
pub use error::{PipeError, Result};
pub use pool::{EngineFamily, PipeConn, PipePool};
pub use rowid::RowIdStore;
pub use table::TableDescriptor;
pub use value::SqlValue;
