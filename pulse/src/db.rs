//! Query interceptor.
//!
//! sqlx exposes no hook registry, so the interception seam is a wrapping
//! handle: [`TrackedPool`] mirrors the textual query surface of
//! `sqlx::PgPool` and times every call that goes through it. Each query is
//! normalized, attributed to its caller and to the ambient request trace,
//! and fed to the N+1 detector. Recording is fire-and-forget.
//!
//! ```ignore
//! let db = pulse.track_pool(pool);
//! let users: Vec<User> = db.fetch_all_as(
//!     sqlx::query_as("SELECT * FROM users WHERE active = $1").bind(true),
//! ).await?;
//! ```

use std::future::Future;
use std::panic::Location;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use sqlx::postgres::{PgArguments, PgQueryResult, PgRow};
use sqlx::query::QueryAs;
use sqlx::{Execute, Executor, PgPool, Postgres};

use crate::engine::Pulse;
use crate::model::{PoolStats, QueryRecord};
use crate::sqlnorm;
use crate::trace;

/// How often the connection-pool snapshot is refreshed.
pub(crate) const POOL_SAMPLE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// A `PgPool` wrapper that records every query issued through it.
///
/// The underlying pool stays reachable via [`TrackedPool::inner`] for code
/// paths that must not be observed (migrations, the engine's own probes).
#[derive(Clone)]
pub struct TrackedPool {
    pool: PgPool,
    pulse: Arc<Pulse>,
}

impl TrackedPool {
    pub(crate) fn new(pool: PgPool, pulse: Arc<Pulse>) -> Self {
        Self { pool, pulse }
    }

    /// The wrapped pool.
    pub fn inner(&self) -> &PgPool {
        &self.pool
    }

    /// Execute a statement, returning the database's result summary.
    #[track_caller]
    pub fn execute<'q, E>(
        &self,
        query: E,
    ) -> impl Future<Output = Result<PgQueryResult, sqlx::Error>> + Send + 'q
    where
        E: Execute<'q, Postgres> + 'q,
    {
        let caller = caller_label();
        let sql = query.sql().to_owned();
        let pool = self.pool.clone();
        let pulse = Arc::clone(&self.pulse);
        async move {
            let started = Instant::now();
            let result = (&pool).execute(query).await;
            let (rows, error) = match &result {
                Ok(done) => (done.rows_affected(), None),
                Err(e) => (0, Some(e.to_string())),
            };
            observe(&pulse, sql, caller, started, rows, error);
            result
        }
    }

    /// Fetch all rows.
    #[track_caller]
    pub fn fetch_all<'q, E>(
        &self,
        query: E,
    ) -> impl Future<Output = Result<Vec<PgRow>, sqlx::Error>> + Send + 'q
    where
        E: Execute<'q, Postgres> + 'q,
    {
        let caller = caller_label();
        let sql = query.sql().to_owned();
        let pool = self.pool.clone();
        let pulse = Arc::clone(&self.pulse);
        async move {
            let started = Instant::now();
            let result = (&pool).fetch_all(query).await;
            let (rows, error) = match &result {
                Ok(rows) => (rows.len() as u64, None),
                Err(e) => (0, Some(e.to_string())),
            };
            observe(&pulse, sql, caller, started, rows, error);
            result
        }
    }

    /// Fetch exactly one row.
    #[track_caller]
    pub fn fetch_one<'q, E>(
        &self,
        query: E,
    ) -> impl Future<Output = Result<PgRow, sqlx::Error>> + Send + 'q
    where
        E: Execute<'q, Postgres> + 'q,
    {
        let caller = caller_label();
        let sql = query.sql().to_owned();
        let pool = self.pool.clone();
        let pulse = Arc::clone(&self.pulse);
        async move {
            let started = Instant::now();
            let result = (&pool).fetch_one(query).await;
            let (rows, error) = match &result {
                Ok(_) => (1, None),
                Err(e) => (0, Some(e.to_string())),
            };
            observe(&pulse, sql, caller, started, rows, error);
            result
        }
    }

    /// Fetch at most one row.
    #[track_caller]
    pub fn fetch_optional<'q, E>(
        &self,
        query: E,
    ) -> impl Future<Output = Result<Option<PgRow>, sqlx::Error>> + Send + 'q
    where
        E: Execute<'q, Postgres> + 'q,
    {
        let caller = caller_label();
        let sql = query.sql().to_owned();
        let pool = self.pool.clone();
        let pulse = Arc::clone(&self.pulse);
        async move {
            let started = Instant::now();
            let result = (&pool).fetch_optional(query).await;
            let (rows, error) = match &result {
                Ok(row) => (u64::from(row.is_some()), None),
                Err(e) => (0, Some(e.to_string())),
            };
            observe(&pulse, sql, caller, started, rows, error);
            result
        }
    }

    /// Fetch all rows mapped through `FromRow`.
    #[track_caller]
    pub fn fetch_all_as<'q, O>(
        &self,
        query: QueryAs<'q, Postgres, O, PgArguments>,
    ) -> impl Future<Output = Result<Vec<O>, sqlx::Error>> + Send + 'q
    where
        O: Send + Unpin + for<'r> sqlx::FromRow<'r, PgRow> + 'q,
    {
        let caller = caller_label();
        let sql = query.sql().to_owned();
        let pool = self.pool.clone();
        let pulse = Arc::clone(&self.pulse);
        async move {
            let started = Instant::now();
            let result = query.fetch_all(&pool).await;
            let (rows, error) = match &result {
                Ok(rows) => (rows.len() as u64, None),
                Err(e) => (0, Some(e.to_string())),
            };
            observe(&pulse, sql, caller, started, rows, error);
            result
        }
    }

    /// Fetch one row mapped through `FromRow`.
    #[track_caller]
    pub fn fetch_one_as<'q, O>(
        &self,
        query: QueryAs<'q, Postgres, O, PgArguments>,
    ) -> impl Future<Output = Result<O, sqlx::Error>> + Send + 'q
    where
        O: Send + Unpin + for<'r> sqlx::FromRow<'r, PgRow> + 'q,
    {
        let caller = caller_label();
        let sql = query.sql().to_owned();
        let pool = self.pool.clone();
        let pulse = Arc::clone(&self.pulse);
        async move {
            let started = Instant::now();
            let result = query.fetch_one(&pool).await;
            let (rows, error) = match &result {
                Ok(_) => (1, None),
                Err(e) => (0, Some(e.to_string())),
            };
            observe(&pulse, sql, caller, started, rows, error);
            result
        }
    }

    /// Fetch at most one row mapped through `FromRow`.
    #[track_caller]
    pub fn fetch_optional_as<'q, O>(
        &self,
        query: QueryAs<'q, Postgres, O, PgArguments>,
    ) -> impl Future<Output = Result<Option<O>, sqlx::Error>> + Send + 'q
    where
        O: Send + Unpin + for<'r> sqlx::FromRow<'r, PgRow> + 'q,
    {
        let caller = caller_label();
        let sql = query.sql().to_owned();
        let pool = self.pool.clone();
        let pulse = Arc::clone(&self.pulse);
        async move {
            let started = Instant::now();
            let result = query.fetch_optional(&pool).await;
            let (rows, error) = match &result {
                Ok(row) => (u64::from(row.is_some()), None),
                Err(e) => (0, Some(e.to_string())),
            };
            observe(&pulse, sql, caller, started, rows, error);
            result
        }
    }
}

/// `file.rs:line` of the application call site.
#[track_caller]
fn caller_label() -> &'static Location<'static> {
    Location::caller()
}

/// Build and submit the [`QueryRecord`], and feed the N+1 detector.
fn observe(
    pulse: &Pulse,
    sql: String,
    caller: &'static Location<'static>,
    started: Instant,
    rows: u64,
    error: Option<String>,
) {
    if !pulse.config().database.is_enabled() {
        return;
    }

    let duration_ms = started.elapsed().as_secs_f64() * 1_000.0;
    let normalized = sqlnorm::normalize(&sql);
    let ambient = trace::current_trace();
    let (trace_id, route) = ambient
        .map(|t| (t.trace_id, t.route))
        .unwrap_or_default();

    if pulse.config().database.n1_enabled() && !trace_id.is_empty() {
        if let Some(detection) =
            pulse
                .n1()
                .record(&trace_id, &route, &normalized.normalized, duration_ms)
        {
            pulse.record_n1(detection);
        }
    }

    pulse.submit_query(QueryRecord {
        sql,
        normalized: normalized.normalized,
        operation: normalized.operation,
        table: normalized.table,
        duration_ms,
        rows,
        error,
        caller: format!("{}:{}", caller.file(), caller.line()),
        trace_id,
        timestamp: Utc::now(),
    });
}

/// Current pool snapshot; written into storage's single cell by the sampler.
pub(crate) fn pool_snapshot(pool: &PgPool) -> PoolStats {
    let open = pool.size();
    let idle = u32::try_from(pool.num_idle()).unwrap_or(0);
    PoolStats {
        max_open: pool.options().get_max_connections(),
        open,
        in_use: open.saturating_sub(idle),
        idle,
        timestamp: Some(Utc::now()),
    }
}
