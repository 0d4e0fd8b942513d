use std::sync::Arc;

use axum::{Extension, Json};

use crate::infrastructure::auth::AuthenticatedUser;
use crate::infrastructure::state::AppState;
use crate::services::hr_sync::HrSyncService;

use super::{envelope, ApiError, Envelope};

pub async fn trigger(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
) -> Result<Json<Envelope<()>>, ApiError> {
    let svc = HrSyncService::new(Arc::clone(&state));
    svc.run_sync().await?;
    Ok(envelope(()))
}
