use axum::Json;
use expo_common::SessionInfo;

use crate::auth::AuthUser;

pub async fn current_session(auth: AuthUser) -> Json<SessionInfo> {
    Json(auth.session())
}
