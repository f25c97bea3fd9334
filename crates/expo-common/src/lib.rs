pub mod api;
pub mod client;
pub mod db;
pub mod logging;
pub mod service;
pub mod store;

pub use api::feedback::{FeedbackRecord, NewFeedback, ValidationErrors, validate_submission};
pub use api::session::{Role, SessionInfo};
pub use service::{FeedbackError, FeedbackService};
pub use store::{FeedbackStore, MemoryFeedbackStore, StoreError};
