use crate::auth::{Session, SessionRepository};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use time::OffsetDateTime;
use tracing::error;

#[derive(Clone)]
pub struct AuthorizeService<T: SessionRepository> {
    session_repo: T,
}

impl<T: SessionRepository> AuthorizeService<T> {
    pub fn new(session_repo: T) -> Self {
        Self { session_repo }
    }

    pub async fn validate_session(&self, session_token: &str) -> Result<Session, StatusCode> {
        let result = self
            .session_repo
            .find_session(session_token)
            .await
            .map_err(|e| {
                error!("Session lookup failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?;

        match result {
            Some(session) if session.is_expired(OffsetDateTime::now_utc()) => {
                Err(StatusCode::UNAUTHORIZED)
            }
            Some(session) => Ok(session),
            None => Err(StatusCode::UNAUTHORIZED),
        }
    }

    pub fn extract_session_from_headers(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get("Authorization")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(|t| t.to_string())
    }
}

pub async fn authorize<T: SessionRepository + 'static>(
    State(auth_service): State<AuthorizeService<T>>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let headers = request.headers();

    let session_token = auth_service
        .extract_session_from_headers(headers)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let session = auth_service.validate_session(&session_token).await?;

    request.extensions_mut().insert(session);

    Ok(next.run(request).await)
}
