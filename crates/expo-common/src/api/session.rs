use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Account capability tier. Resolved once when a session is established.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Role {
    Admin,
    Exhibitor,
    Attendee,
}

/// Identity attached to an authenticated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub subject: String,
    pub role: Role,
}
