use crate::errors::StashError;
use crate::settings::Settings;
use crate::storage;
use axum::http::HeaderMap;
use sea_orm::DatabaseConnection;

pub const SESSION_COOKIE_NAME: &str = "stashpoint_session";

#[derive(Clone, Debug)]
pub struct SessionCookie {
    pub session_id: String,
}

impl SessionCookie {
    pub fn new(session_id: String) -> Self {
        Self { session_id }
    }

    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        // Multiple Cookie headers are legal over HTTP/2
        for header in headers.get_all(axum::http::header::COOKIE) {
            let Ok(cookie_header) = header.to_str() else {
                continue;
            };
            for cookie in cookie_header.split(';') {
                let cookie = cookie.trim();
                if let Some(value) = cookie
                    .strip_prefix(SESSION_COOKIE_NAME)
                    .and_then(|s| s.strip_prefix('='))
                {
                    if !value.is_empty() {
                        return Some(Self {
                            session_id: value.to_string(),
                        });
                    }
                }
            }
        }
        None
    }

    pub fn to_cookie_header(&self, settings: &Settings) -> String {
        let secure = settings.public_url().starts_with("https://");

        format!(
            "{}={}; HttpOnly; {}SameSite=Lax; Path=/; Max-Age={}",
            SESSION_COOKIE_NAME,
            self.session_id,
            if secure { "Secure; " } else { "" },
            settings.session.ttl_secs
        )
    }

    pub fn delete_cookie_header() -> String {
        format!(
            "{}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0",
            SESSION_COOKIE_NAME
        )
    }
}

/// The user behind a live browser session.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub subject: String,
    pub username: String,
    pub session_id: String,
}

/// Resolve the session cookie on a request to its user.
///
/// Returns `None` for a missing cookie, an unknown or expired session, or a
/// disabled account.
pub async fn authenticated_user(
    db: &DatabaseConnection,
    headers: &HeaderMap,
) -> Result<Option<AuthenticatedUser>, StashError> {
    let Some(cookie) = SessionCookie::from_headers(headers) else {
        return Ok(None);
    };

    let Some(session) = storage::get_session(db, &cookie.session_id).await? else {
        return Ok(None);
    };

    match storage::get_user_by_subject(db, &session.subject).await? {
        Some(user) if user.enabled == 1 => Ok(Some(AuthenticatedUser {
            subject: user.subject,
            username: user.username,
            session_id: session.session_id,
        })),
        _ => Ok(None),
    }
}
