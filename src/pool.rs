//! Connection pools for the two sides of the copy.
//!
//! One [`PipePool`] per side. The engine family is detected from the
//! connection URL; each family wraps its own pooling product behind a
//! static-dispatch enum. On first connection every pool probes the remote
//! engine for a core/worker-count hint that the engine uses to cap
//! parallelism when no explicit degree is requested.

use crate::config::EndpointConfig;
use crate::error::{PipeError, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool as PgDeadPool, RecyclingMethod};
use mysql_async::prelude::*;
use mysql_async::{Opts, OptsBuilder, PoolConstraints, PoolOpts};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Extra connections kept above the worker degree.
const POOL_HEADROOM: usize = 8;

/// MySQL session frame size below which a warning is emitted.
const RECOMMENDED_MAX_ALLOWED_PACKET: i64 = 16 * 1024 * 1024;

/// Database engine family, detected from the connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineFamily {
    Postgres,
    MySql,
}

impl EngineFamily {
    /// Detect the family from a connection URL.
    pub fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(EngineFamily::Postgres)
        } else if url.starts_with("mysql://") {
            Ok(EngineFamily::MySql)
        } else {
            Err(PipeError::Config(format!("unsupported connection URL '{}'", url)))
        }
    }
}

/// A ready connection from one side's pool.
pub enum PipeConn {
    Postgres(deadpool_postgres::Object),
    MySql(mysql_async::Conn),
}

impl PipeConn {
    /// Unwrap the PostgreSQL connection; configuration validation
    /// guarantees this on the source side.
    pub fn into_postgres(self) -> Result<deadpool_postgres::Object> {
        match self {
            PipeConn::Postgres(c) => Ok(c),
            PipeConn::MySql(_) => Err(PipeError::Config(
                "expected a PostgreSQL connection on this side".into(),
            )),
        }
    }
}

/// Sized, reusable connection pool for one side of the copy.
pub enum PipePool {
    Postgres(PgPipePool),
    MySql(MyPipePool),
}

impl PipePool {
    /// Connect, probe engine capacity, and return the pool.
    ///
    /// `name` tags every session from this pool for observability.
    pub async fn connect(name: &str, endpoint: &EndpointConfig) -> Result<Self> {
        match EngineFamily::from_url(&endpoint.url)? {
            EngineFamily::Postgres => Ok(PipePool::Postgres(PgPipePool::connect(name, endpoint).await?)),
            EngineFamily::MySql => Ok(PipePool::MySql(MyPipePool::connect(name, endpoint).await?)),
        }
    }

    /// The engine family of this side.
    pub fn family(&self) -> EngineFamily {
        match self {
            PipePool::Postgres(_) => EngineFamily::Postgres,
            PipePool::MySql(_) => EngineFamily::MySql,
        }
    }

    /// Core/worker-count hint reported by the remote engine.
    pub fn capacity_hint(&self) -> usize {
        match self {
            PipePool::Postgres(p) => p.capacity_hint,
            PipePool::MySql(p) => p.capacity_hint,
        }
    }

    /// Resize the pool for `degree` workers plus headroom.
    pub async fn resize(&self, degree: usize) {
        match self {
            PipePool::Postgres(p) => p.resize(degree).await,
            PipePool::MySql(p) => p.resize(degree).await,
        }
    }

    /// Acquire a ready connection: autocommit semantics disabled, session
    /// tagged with the pool identity.
    pub async fn acquire(&self) -> Result<PipeConn> {
        match self {
            PipePool::Postgres(p) => Ok(PipeConn::Postgres(p.acquire().await?)),
            PipePool::MySql(p) => Ok(PipeConn::MySql(p.acquire().await?)),
        }
    }

    /// Close all connections.
    pub async fn close(&self) {
        match self {
            PipePool::Postgres(p) => p.pool.lock().await.close(),
            PipePool::MySql(p) => {
                let pool = p.pool.lock().await.clone();
                if let Err(e) = pool.disconnect().await {
                    warn!(error = %e, "Error while disconnecting MySQL pool");
                }
            }
        }
    }
}

/// PostgreSQL side, backed by deadpool-postgres.
pub struct PgPipePool {
    name: String,
    pg_config: tokio_postgres::Config,
    pool: Mutex<PgDeadPool>,
    /// Bumped on exhaustion recovery; suffixes the session tag so the
    /// re-provisioned pool has a fresh identity.
    version: AtomicU32,
    capacity_hint: usize,
}

impl PgPipePool {
    async fn connect(name: &str, endpoint: &EndpointConfig) -> Result<Self> {
        let mut pg_config = tokio_postgres::Config::from_str(&endpoint.url)
            .map_err(|e| PipeError::Config(format!("invalid PostgreSQL URL: {}", e)))?;
        pg_config.user(&endpoint.user);
        pg_config.password(&endpoint.password);
        pg_config.application_name(&format!("rowpipe:{}", name));

        let pool = Self::build(&pg_config, POOL_HEADROOM)?;

        // Capacity probe, once per pool. The view is world-readable, so a
        // failure here means connectivity, not privilege; mirror the
        // conservative default rather than failing the run.
        let capacity_hint = {
            let client = pool
                .get()
                .await
                .map_err(|e| PipeError::pool(e, format!("connecting pool '{}'", name)))?;
            match client
                .query_opt("SELECT setting FROM pg_settings WHERE name = 'max_worker_processes'", &[])
                .await
            {
                Ok(Some(row)) => row
                    .get::<_, String>(0)
                    .parse::<usize>()
                    .unwrap_or(1)
                    .max(1),
                Ok(None) => 1,
                Err(e) => {
                    warn!(error = %e, "Engine capacity probe failed; assuming 1 worker");
                    1
                }
            }
        };

        info!(
            pool = name,
            workers = capacity_hint,
            "Connected to PostgreSQL"
        );

        Ok(Self {
            name: name.to_string(),
            pg_config,
            pool: Mutex::new(pool),
            version: AtomicU32::new(0),
            capacity_hint,
        })
    }

    fn build(pg_config: &tokio_postgres::Config, max_size: usize) -> Result<PgDeadPool> {
        let mgr = Manager::from_config(
            pg_config.clone(),
            tokio_postgres::NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        PgDeadPool::builder(mgr)
            .max_size(max_size)
            .build()
            .map_err(|e| PipeError::pool(e, "building PostgreSQL pool"))
    }

    async fn resize(&self, degree: usize) {
        self.pool.lock().await.resize(degree + POOL_HEADROOM);
    }

    async fn acquire(&self) -> Result<deadpool_postgres::Object> {
        match self.try_acquire().await {
            Ok(conn) => Ok(conn),
            Err(e) if Self::is_provisioning_error(&e) => {
                // Re-provision under a fresh identity and retry once.
                let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
                error!(
                    pool = %self.name,
                    version,
                    error = %e,
                    "Transient pool-provisioning failure; re-provisioning pool"
                );
                let mut pg_config = self.pg_config.clone();
                pg_config.application_name(&format!("rowpipe:{}-{}", self.name, version));
                let mut pool = self.pool.lock().await;
                let max_size = pool.status().max_size;
                *pool = Self::build(&pg_config, max_size)?;
                drop(pool);
                self.try_acquire().await
            }
            Err(e) => Err(e),
        }
    }

    async fn try_acquire(&self) -> Result<deadpool_postgres::Object> {
        let pool = self.pool.lock().await.clone();
        pool.get()
            .await
            .map_err(|e| PipeError::pool(e, format!("acquiring from pool '{}'", self.name)))
    }

    fn is_provisioning_error(err: &PipeError) -> bool {
        // deadpool reports exhaustion/teardown as Timeouts or Closed;
        // anything carrying a backend error is a real failure.
        matches!(err, PipeError::Pool { message, .. }
            if message.contains("Timed out") || message.contains("closed"))
    }
}

/// MySQL side, backed by the mysql_async built-in pool.
pub struct MyPipePool {
    name: String,
    opts: Opts,
    pool: Mutex<mysql_async::Pool>,
    version: AtomicU32,
    max_size: std::sync::atomic::AtomicUsize,
    capacity_hint: usize,
}

impl MyPipePool {
    async fn connect(name: &str, endpoint: &EndpointConfig) -> Result<Self> {
        let base = Opts::from_url(&endpoint.url)
            .map_err(|e| PipeError::Config(format!("invalid MySQL URL: {}", e)))?;
        let opts: Opts = OptsBuilder::from_opts(base)
            .user(Some(endpoint.user.clone()))
            .pass(Some(endpoint.password.clone()))
            // All destination writes run in explicit transactions.
            .init(vec!["SET autocommit=0".to_string()])
            .pool_opts(Self::pool_opts(POOL_HEADROOM))
            .into();
        let pool = mysql_async::Pool::new(opts.clone());

        let mut conn = pool
            .get_conn()
            .await
            .map_err(|e| PipeError::pool(e, format!("connecting pool '{}'", name)))?;

        // Capacity probe plus the session frame size check.
        let (capacity_hint, max_allowed_packet) = match conn
            .query_first::<(i64, i64), _>(
                "SELECT @@innodb_read_io_threads, @@max_allowed_packet",
            )
            .await
        {
            Ok(Some((threads, packet))) => (threads.max(1) as usize, packet),
            Ok(None) => (1, RECOMMENDED_MAX_ALLOWED_PACKET),
            Err(e) => {
                warn!(error = %e, "Engine capacity probe failed; assuming 1 worker");
                (1, RECOMMENDED_MAX_ALLOWED_PACKET)
            }
        };
        drop(conn);

        if max_allowed_packet < RECOMMENDED_MAX_ALLOWED_PACKET {
            warn!(
                max_allowed_packet,
                "The negotiated session frame size is small; consider raising \
                 max_allowed_packet to at least 16 MiB for better batch throughput"
            );
        }

        info!(pool = name, workers = capacity_hint, "Connected to MySQL");

        Ok(Self {
            name: name.to_string(),
            opts,
            pool: Mutex::new(pool),
            version: AtomicU32::new(0),
            max_size: std::sync::atomic::AtomicUsize::new(POOL_HEADROOM),
            capacity_hint,
        })
    }

    fn pool_opts(max: usize) -> PoolOpts {
        let max = max.max(1);
        PoolOpts::default().with_constraints(
            PoolConstraints::new(1, max).unwrap_or_default(),
        )
    }

    async fn resize(&self, degree: usize) {
        // Pool constraints are fixed at build time; swap in a pool with
        // the new bounds and let the old one drain.
        let max = degree + POOL_HEADROOM;
        self.max_size.store(max, Ordering::SeqCst);
        let opts: Opts = OptsBuilder::from_opts(self.opts.clone())
            .pool_opts(Self::pool_opts(max))
            .into();
        let mut pool = self.pool.lock().await;
        let old = pool.clone();
        *pool = mysql_async::Pool::new(opts);
        drop(pool);
        if let Err(e) = old.disconnect().await {
            warn!(error = %e, "Error while draining resized MySQL pool");
        }
    }

    async fn acquire(&self) -> Result<mysql_async::Conn> {
        match self.try_acquire().await {
            Ok(conn) => Ok(conn),
            Err(mysql_async::Error::Driver(e)) => {
                // Driver-level acquisition failures (pool torn down) are
                // the recognized transient class; rebuild once and retry.
                let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
                error!(
                    pool = %self.name,
                    version,
                    error = %e,
                    "Transient pool-provisioning failure; re-provisioning pool"
                );
                let max = self.max_size.load(Ordering::SeqCst);
                let opts: Opts = OptsBuilder::from_opts(self.opts.clone())
                    .pool_opts(Self::pool_opts(max))
                    .into();
                *self.pool.lock().await = mysql_async::Pool::new(opts);
                self.try_acquire()
                    .await
                    .map_err(|e| PipeError::pool(e, format!("acquiring from pool '{}'", self.name)))
            }
            Err(e) => Err(PipeError::pool(e, format!("acquiring from pool '{}'", self.name))),
        }
    }

    async fn try_acquire(&self) -> std::result::Result<mysql_async::Conn, mysql_async::Error> {
        let pool = self.pool.lock().await.clone();
        pool.get_conn().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_family_detection() {
        assert_eq!(
            EngineFamily::from_url("postgres://h/db").unwrap(),
            EngineFamily::Postgres
        );
        assert_eq!(
            EngineFamily::from_url("postgresql://h/db").unwrap(),
            EngineFamily::Postgres
        );
        assert_eq!(
            EngineFamily::from_url("mysql://h/db").unwrap(),
            EngineFamily::MySql
        );
        assert!(EngineFamily::from_url("oracle://h/db").is_err());
    }

    #[test]
    fn provisioning_error_recognition() {
        let transient = PipeError::pool("Timed out in queue", "acquiring");
        assert!(PgPipePool::is_provisioning_error(&transient));
        let hard = PipeError::pool("password authentication failed", "acquiring");
        assert!(!PgPipePool::is_provisioning_error(&hard));
    }
}
