//! Async query service
//!
//! Backend calls are blocking, so each query runs on tokio's blocking pool.
//! A semaphore bounds how many queries run at once; stages inside a query
//! still run one after the other on a single task.

use crate::error::{QueryError, Result};
use crate::executor::{QueryExecutor, QueryOutcome};
use crate::plan::CompiledQuery;
use crate::result::StageResult;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

pub struct QueryService {
    executor: Arc<QueryExecutor>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl QueryService {
    pub fn new(executor: Arc<QueryExecutor>) -> Self {
        let max_concurrent = executor.config().max_concurrent_queries.max(1);
        QueryService {
            executor,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    /// Run a query once a slot is free
    pub async fn execute(&self, query: CompiledQuery, start: StageResult) -> Result<QueryOutcome> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| QueryError::ServiceClosed)?;
        debug!(
            in_flight = self.in_flight(),
            stages = query.stages.len(),
            "query admitted"
        );

        let executor = Arc::clone(&self.executor);
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            executor.execute(&query, start)
        });
        handle.await?
    }

    /// Run a query starting from every registered root
    pub async fn execute_from_roots(&self, query: CompiledQuery) -> Result<QueryOutcome> {
        let start = StageResult::from_roots(&self.executor.roots());
        self.execute(query, start).await
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    /// Stop admitting queries; running ones complete
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}
