use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::PoolError;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_postgres::Error as PgError;
use uuid::Uuid;

use crate::api::feedback::{FeedbackRecord, NewFeedback};
use crate::db::DbPoolError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("postgres error: {0}")]
    Postgres(#[from] PgError),
    #[error("failed to build pool: {0}")]
    PoolBuild(#[from] DbPoolError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence seam for feedback records.
///
/// Implementations assign the id and both timestamps on insert and return
/// records from `list_all` in insertion order.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    async fn insert(&self, feedback: NewFeedback) -> Result<FeedbackRecord, StoreError>;

    async fn list_all(&self) -> Result<Vec<FeedbackRecord>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Process-local store for tests and database-less local runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryFeedbackStore {
    records: Arc<RwLock<Vec<FeedbackRecord>>>,
}

impl MemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeedbackStore for MemoryFeedbackStore {
    async fn insert(&self, feedback: NewFeedback) -> Result<FeedbackRecord, StoreError> {
        let now = Utc::now();
        let record = FeedbackRecord {
            id: Uuid::new_v4(),
            feedback,
            created_at: now,
            updated_at: now,
        };

        self.records.write().await.push(record.clone());
        Ok(record)
    }

    async fn list_all(&self) -> Result<Vec<FeedbackRecord>, StoreError> {
        Ok(self.records.read().await.clone())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
