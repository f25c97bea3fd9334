use async_trait::async_trait;
use tokio_postgres::Row;
use tracing::instrument;
use uuid::Uuid;

use crate::api::feedback::{FeedbackRecord, NewFeedback};
use crate::db::PgPool;
use crate::db::util::timed;
use crate::store::{FeedbackStore, StoreError};

const INSERT_FEEDBACK: &str = "INSERT INTO expo.feedback (\
        id,\
        full_name,\
        email,\
        event_type,\
        satisfaction,\
        ease_of_use,\
        customer_service,\
        features,\
        recommendation,\
        improvement,\
        success_story,\
        allow_public_use\
    ) VALUES (\
        $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12\
    ) \
    RETURNING created_at, updated_at";

const SELECT_ALL_FEEDBACK: &str = "SELECT \
        id, full_name, email, event_type, \
        satisfaction, ease_of_use, customer_service, features, \
        recommendation, improvement, success_story, allow_public_use, \
        created_at, updated_at \
    FROM expo.feedback \
    ORDER BY seq ASC";

/// Feedback records in the `expo.feedback` table.
#[derive(Clone)]
pub struct PgFeedbackStore {
    pool: PgPool,
}

impl PgFeedbackStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn record_from_row(row: &Row) -> FeedbackRecord {
    FeedbackRecord {
        id: row.get("id"),
        feedback: NewFeedback {
            full_name: row.get("full_name"),
            email: row.get("email"),
            event_type: row.get("event_type"),
            satisfaction: row.get("satisfaction"),
            ease_of_use: row.get("ease_of_use"),
            customer_service: row.get("customer_service"),
            features: row.get("features"),
            recommendation: row.get("recommendation"),
            improvement: row.get("improvement"),
            success_story: row.get("success_story"),
            allow_public_use: row.get("allow_public_use"),
        },
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl FeedbackStore for PgFeedbackStore {
    #[instrument(skip(self, feedback))]
    async fn insert(&self, feedback: NewFeedback) -> Result<FeedbackRecord, StoreError> {
        let id = Uuid::new_v4();
        let client = self.pool.get().await?;
        let stmt = client.prepare_cached(INSERT_FEEDBACK).await?;

        let row = timed(
            "insert_feedback",
            client.query_one(
                &stmt,
                &[
                    &id,
                    &feedback.full_name,
                    &feedback.email,
                    &feedback.event_type,
                    &feedback.satisfaction,
                    &feedback.ease_of_use,
                    &feedback.customer_service,
                    &feedback.features,
                    &feedback.recommendation,
                    &feedback.improvement,
                    &feedback.success_story,
                    &feedback.allow_public_use,
                ],
            ),
        )
        .await?;

        Ok(FeedbackRecord {
            id,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            feedback,
        })
    }

    #[instrument(skip(self))]
    async fn list_all(&self) -> Result<Vec<FeedbackRecord>, StoreError> {
        let client = self.pool.get().await?;
        let stmt = client.prepare_cached(SELECT_ALL_FEEDBACK).await?;
        let rows = timed("list_feedback", client.query(&stmt, &[])).await?;

        Ok(rows.iter().map(record_from_row).collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}
