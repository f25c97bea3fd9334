use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

const FULL_NAME: &str = "fullName";
const EMAIL: &str = "email";
const EVENT_TYPE: &str = "eventType";
const SATISFACTION: &str = "satisfaction";
const EASE_OF_USE: &str = "easeOfUse";
const CUSTOMER_SERVICE: &str = "customerService";
const FEATURES: &str = "features";
const RECOMMENDATION: &str = "recommendation";
const IMPROVEMENT: &str = "improvement";
const SUCCESS_STORY: &str = "successStory";
const ALLOW_PUBLIC_USE: &str = "allowPublicUse";

/// Every key a submission may carry, in schema order.
pub const SCHEMA_FIELDS: [&str; 11] = [
    FULL_NAME,
    EMAIL,
    EVENT_TYPE,
    SATISFACTION,
    EASE_OF_USE,
    CUSTOMER_SERVICE,
    FEATURES,
    RECOMMENDATION,
    IMPROVEMENT,
    SUCCESS_STORY,
    ALLOW_PUBLIC_USE,
];

/// A submission that passed [`validate_submission`] and can be handed to a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFeedback {
    pub full_name: String,
    pub email: String,
    pub event_type: String,
    // Ratings are documented as 1-5 but the range is not checked.
    pub satisfaction: i32,
    pub ease_of_use: i32,
    pub customer_service: i32,
    pub features: i32,
    pub recommendation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub improvement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_story: Option<String>,
    #[serde(default)]
    pub allow_public_use: bool,
}

/// A persisted evaluation of an event. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub feedback: NewFeedback,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Body returned by a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackCreated {
    pub message: String,
    pub feedback: FeedbackRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldErrorKind {
    Required,
    InvalidType,
    UnknownField,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub kind: FieldErrorKind,
    pub message: String,
}

impl FieldError {
    fn required(field: &str) -> Self {
        Self {
            field: field.to_string(),
            kind: FieldErrorKind::Required,
            message: format!("{field} is required"),
        }
    }

    fn invalid_type(field: &str, expected: &str) -> Self {
        Self {
            field: field.to_string(),
            kind: FieldErrorKind::InvalidType,
            message: format!("{field} must be {expected}"),
        }
    }

    fn unknown(field: &str) -> Self {
        Self {
            field: field.to_string(),
            kind: FieldErrorKind::UnknownField,
            message: format!("{field} is not a feedback field"),
        }
    }

    fn not_an_object() -> Self {
        Self {
            field: String::new(),
            kind: FieldErrorKind::InvalidType,
            message: "payload must be a JSON object".to_string(),
        }
    }
}

/// Field-level diagnostics for a rejected submission.
///
/// Serialized as `{"errors": [...]}` and handed back to callers as-is. The
/// shape is diagnostic output, not something clients should branch on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn fields(&self) -> Vec<&str> {
        self.errors.iter().map(|error| error.field.as_str()).collect()
    }

    pub fn contains(&self, field: &str, kind: FieldErrorKind) -> bool {
        self.errors
            .iter()
            .any(|error| error.field == field && error.kind == kind)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "feedback validation failed: ")?;
        let messages = self
            .errors
            .iter()
            .map(|error| error.message.as_str())
            .collect::<Vec<_>>();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

struct FieldChecker<'a> {
    fields: &'a Map<String, Value>,
    errors: Vec<FieldError>,
}

impl FieldChecker<'_> {
    fn text(&mut self, name: &str) -> Option<String> {
        match self.fields.get(name) {
            None | Some(Value::Null) => {
                self.errors.push(FieldError::required(name));
                None
            }
            Some(Value::String(value)) if value.trim().is_empty() => {
                self.errors.push(FieldError::required(name));
                None
            }
            Some(Value::String(value)) => Some(value.clone()),
            Some(_) => {
                self.errors.push(FieldError::invalid_type(name, "a string"));
                None
            }
        }
    }

    fn rating(&mut self, name: &str) -> Option<i32> {
        match self.fields.get(name) {
            None | Some(Value::Null) => {
                self.errors.push(FieldError::required(name));
                None
            }
            Some(Value::Number(number)) => {
                let rating = number.as_i64().and_then(|value| i32::try_from(value).ok());
                if rating.is_none() {
                    self.errors.push(FieldError::invalid_type(name, "an integer"));
                }
                rating
            }
            Some(_) => {
                self.errors.push(FieldError::invalid_type(name, "an integer"));
                None
            }
        }
    }

    fn optional_text(&mut self, name: &str) -> Option<String> {
        match self.fields.get(name) {
            None | Some(Value::Null) => None,
            Some(Value::String(value)) => Some(value.clone()),
            Some(_) => {
                self.errors.push(FieldError::invalid_type(name, "a string"));
                None
            }
        }
    }

    fn flag(&mut self, name: &str) -> bool {
        match self.fields.get(name) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(value)) => *value,
            Some(_) => {
                self.errors.push(FieldError::invalid_type(name, "a boolean"));
                false
            }
        }
    }

    fn reject_unknown(&mut self) {
        for key in self.fields.keys() {
            if !SCHEMA_FIELDS.contains(&key.as_str()) {
                self.errors.push(FieldError::unknown(key));
            }
        }
    }

    fn finish(self) -> ValidationErrors {
        ValidationErrors {
            errors: self.errors,
        }
    }
}

/// Check a raw JSON submission against the feedback schema.
///
/// Every problem is reported, not only the first: schema fields in schema
/// order, then keys the schema does not know (sorted by key). Accepted strings
/// are kept verbatim.
pub fn validate_submission(payload: &Value) -> Result<NewFeedback, ValidationErrors> {
    let Some(fields) = payload.as_object() else {
        return Err(ValidationErrors {
            errors: vec![FieldError::not_an_object()],
        });
    };

    let mut check = FieldChecker {
        fields,
        errors: Vec::new(),
    };

    let full_name = check.text(FULL_NAME);
    let email = check.text(EMAIL);
    let event_type = check.text(EVENT_TYPE);
    let satisfaction = check.rating(SATISFACTION);
    let ease_of_use = check.rating(EASE_OF_USE);
    let customer_service = check.rating(CUSTOMER_SERVICE);
    let features = check.rating(FEATURES);
    let recommendation = check.text(RECOMMENDATION);
    let improvement = check.optional_text(IMPROVEMENT);
    let success_story = check.optional_text(SUCCESS_STORY);
    let allow_public_use = check.flag(ALLOW_PUBLIC_USE);
    check.reject_unknown();

    let (
        Some(full_name),
        Some(email),
        Some(event_type),
        Some(satisfaction),
        Some(ease_of_use),
        Some(customer_service),
        Some(features),
        Some(recommendation),
    ) = (
        full_name,
        email,
        event_type,
        satisfaction,
        ease_of_use,
        customer_service,
        features,
        recommendation,
    )
    else {
        return Err(check.finish());
    };

    if !check.errors.is_empty() {
        return Err(check.finish());
    }

    Ok(NewFeedback {
        full_name,
        email,
        event_type,
        satisfaction,
        ease_of_use,
        customer_service,
        features,
        recommendation,
        improvement,
        success_story,
        allow_public_use,
    })
}
