use crate::db::DbPool;
use crate::types::{Result, StratusError, UserId};
use axum::http::HeaderMap;

/// Resolves the current caller from a bearer-token session. Anything short
/// of a live session is an authorization failure; no side effects happen
/// before this check passes.
pub async fn authenticate(headers: &HeaderMap, pool: &DbPool) -> Result<UserId> {
    let token = bearer_token(headers)
        .ok_or_else(|| StratusError::Unauthorized("Missing bearer token".to_string()))?;

    match crate::db::lookup_session(pool, token).await? {
        Some(user_id) => Ok(user_id),
        None => Err(StratusError::Unauthorized("Invalid or expired session".to_string()).into()),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
