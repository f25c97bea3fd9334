use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
};
use expo_common::FeedbackRecord;
use expo_common::api::feedback::FeedbackCreated;
use serde_json::Value;

use crate::SharedState;
use crate::error::ApiError;

const SUBMITTED: &str = "Feedback submitted successfully";
const SUBMIT_FAILED: &str = "Error submitting feedback";
const FETCH_FAILED: &str = "Error fetching feedback";

pub async fn submit_feedback(
    State(state): State<SharedState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<FeedbackCreated>), ApiError> {
    let Json(payload) = payload.map_err(|rejection| ApiError::MalformedBody {
        message: SUBMIT_FAILED,
        detail: rejection.body_text(),
    })?;

    let feedback = state
        .feedback
        .submit(&payload)
        .await
        .map_err(|err| ApiError::feedback(SUBMIT_FAILED, err))?;

    Ok((
        StatusCode::CREATED,
        Json(FeedbackCreated {
            message: SUBMITTED.to_string(),
            feedback,
        }),
    ))
}

pub async fn list_feedback(
    State(state): State<SharedState>,
) -> Result<Json<Vec<FeedbackRecord>>, ApiError> {
    let records = state
        .feedback
        .list_all()
        .await
        .map_err(|err| ApiError::feedback(FETCH_FAILED, err))?;

    Ok(Json(records))
}
