use std::sync::Arc;

use expo_metrics::{FEEDBACK_REJECTED_TOTAL, FEEDBACK_STORE_ERRORS_TOTAL, FEEDBACK_SUBMITTED_TOTAL};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::api::feedback::{FeedbackRecord, ValidationErrors, validate_submission};
use crate::store::{FeedbackStore, StoreError};

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    #[error("feedback store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

/// Submit and list feedback. Holds nothing but a handle to the store.
#[derive(Clone)]
pub struct FeedbackService {
    store: Arc<dyn FeedbackStore>,
}

fn store_failure(operation: &'static str) -> impl FnOnce(StoreError) -> FeedbackError {
    move |err| {
        metrics::counter!(FEEDBACK_STORE_ERRORS_TOTAL, "operation" => operation).increment(1);
        error!(operation, error = %err, "feedback store call failed");
        FeedbackError::StoreUnavailable(err)
    }
}

impl FeedbackService {
    pub fn new(store: Arc<dyn FeedbackStore>) -> Self {
        Self { store }
    }

    /// Validate `payload` and persist it as a new record.
    ///
    /// Nothing is written when validation fails.
    #[instrument(skip_all)]
    pub async fn submit(&self, payload: &Value) -> Result<FeedbackRecord, FeedbackError> {
        let feedback = validate_submission(payload).inspect_err(|errors| {
            metrics::counter!(FEEDBACK_REJECTED_TOTAL).increment(1);
            warn!(fields = ?errors.fields(), "feedback rejected");
        })?;

        let record = self
            .store
            .insert(feedback)
            .await
            .map_err(store_failure("insert"))?;

        metrics::counter!(FEEDBACK_SUBMITTED_TOTAL).increment(1);
        info!(id = %record.id, event_type = %record.feedback.event_type, "feedback submitted");

        Ok(record)
    }

    #[instrument(skip_all)]
    pub async fn list_all(&self) -> Result<Vec<FeedbackRecord>, FeedbackError> {
        self.store
            .list_all()
            .await
            .map_err(store_failure("list_all"))
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }
}
