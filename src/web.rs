//! HTTP surface of the device authorization flow.
//!
//! JSON endpoints used by the CLI (`POST /device`, `POST /token`) and by the
//! signed-in web app (`POST /approve`), plus the browser pages a user lands on
//! from the verification URL (`/device`, `/login`).
use crate::clock::{Clock, SystemClock};
use crate::device_flow::{ClientInfo, DeviceFlow};
use crate::errors::DeviceFlowError;
use crate::session::{self, AuthenticatedUser, SessionCookie};
use crate::settings::Settings;
use crate::storage;
use axum::body::{Body, Bytes};
use axum::extract::{Form, Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub device_flow: DeviceFlow,
}

impl AppState {
    pub fn new(settings: Settings, db: DatabaseConnection, clock: Arc<dyn Clock>) -> Self {
        let settings = Arc::new(settings);
        let device_flow = DeviceFlow::new(db.clone(), settings.clone(), clock);
        Self {
            settings,
            db,
            device_flow,
        }
    }
}

// Security headers middleware
async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    // X-Frame-Options: the approval page must never be framed
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );

    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );

    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static(
            "default-src 'self'; style-src 'self' 'unsafe-inline'; form-action 'self'",
        ),
    );

    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // CLI device authorization
        .route("/device", post(device_authorization).get(device_page))
        .route("/token", post(token))
        // Approval by a signed-in user
        .route("/approve", post(approve))
        .route("/device/approve", post(device_approve_submit))
        // Browser sessions
        .route("/login", get(login_page).post(login_submit))
        .route("/logout", get(logout))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(settings: Settings, db: DatabaseConnection) -> miette::Result<()> {
    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let state = AppState::new(settings, db, Arc::new(SystemClock));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    tracing::info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .into_diagnostic()?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

fn error_status(e: &DeviceFlowError) -> StatusCode {
    match e {
        DeviceFlowError::Unauthenticated => StatusCode::UNAUTHORIZED,
        DeviceFlowError::MissingField(_) => StatusCode::BAD_REQUEST,
        DeviceFlowError::InvalidCode => StatusCode::NOT_FOUND,
        DeviceFlowError::AlreadyApproved | DeviceFlowError::Expired => StatusCode::CONFLICT,
        DeviceFlowError::CreationFailed(_) | DeviceFlowError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for DeviceFlowError {
    fn into_response(self) -> Response {
        let status = error_status(&self);

        let description = if status.is_server_error() {
            tracing::error!(error = %self, "device flow request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(json!({
                "error": self.code(),
                "error_description": description,
            })),
        )
            .into_response()
    }
}

fn no_store(body: impl IntoResponse) -> Response {
    (
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// Parse an optional JSON body; an empty or malformed body yields the default.
fn json_body<T: DeserializeOwned + Default>(body: &Bytes) -> T {
    serde_json::from_slice(body).unwrap_or_default()
}

fn client_info(headers: &HeaderMap) -> ClientInfo {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(String::from);

    let ip_address = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    ClientInfo {
        ip_address,
        user_agent,
    }
}

async fn require_user(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthenticatedUser, DeviceFlowError> {
    session::authenticated_user(&state.db, headers)
        .await?
        .ok_or(DeviceFlowError::Unauthenticated)
}

// ========================================
// Device authorization JSON API
// ========================================

/// POST /device - start a handshake for a CLI client
async fn device_authorization(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, DeviceFlowError> {
    let authorization = state
        .device_flow
        .initiate(Some(client_info(&headers)))
        .await?;
    Ok(no_store(Json(authorization)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApproveRequest {
    user_code: Option<String>,
}

/// POST /approve - approve a user code from the signed-in web app
async fn approve(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, DeviceFlowError> {
    let user = require_user(&state, &headers).await?;

    let req: ApproveRequest = json_body(&body);
    let user_code = req
        .user_code
        .filter(|c| !c.trim().is_empty())
        .ok_or(DeviceFlowError::MissingField("userCode"))?;

    state.device_flow.approve(&user_code, &user.subject).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest {
    device_code: Option<String>,
}

/// POST /token - poll a handshake with the CLI's device code
async fn token(State(state): State<AppState>, body: Bytes) -> Result<Response, DeviceFlowError> {
    let req: TokenRequest = json_body(&body);
    let device_code = req
        .device_code
        .ok_or(DeviceFlowError::MissingField("deviceCode"))?;

    let status = state.device_flow.poll(&device_code).await?;
    Ok(no_store(Json(status)))
}

// ========================================
// Browser verification pages
// ========================================

fn page(title: &str, body: &str) -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title}</title>
    <style>
        body {{ font-family: sans-serif; max-width: 600px; margin: 50px auto; padding: 20px; }}
        .container {{ background: #f5f5f5; padding: 30px; border-radius: 8px; }}
        h1 {{ margin-top: 0; }}
        input {{ font-size: 18px; padding: 10px; width: 100%; box-sizing: border-box; margin: 10px 0; }}
        button {{ background: #007bff; color: white; border: none; padding: 12px 24px; font-size: 16px; border-radius: 4px; cursor: pointer; }}
        .device-info {{ background: white; padding: 15px; border-radius: 4px; margin: 20px 0; }}
        .error {{ color: #721c24; background: #f8d7da; padding: 10px; border-radius: 4px; }}
        .success {{ color: #155724; background: #d4edda; padding: 10px; border-radius: 4px; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>{title}</h1>
        {body}
    </div>
</body>
</html>"#,
        title = html_escape(title),
    ))
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

/// Only local absolute paths are accepted as post-login destinations.
fn safe_return_to(return_to: Option<&str>) -> String {
    match return_to {
        Some(path) if path.starts_with('/') && !path.starts_with("//") && !path.contains('\\') => {
            path.to_string()
        }
        _ => "/device".to_string(),
    }
}

fn login_redirect(return_to: &str) -> Redirect {
    Redirect::to(&format!(
        "/login?return_to={}",
        urlencoding::encode(return_to)
    ))
}

fn device_page_path(user_code: Option<&str>) -> String {
    match user_code {
        Some(code) if !code.is_empty() => {
            format!("/device?user_code={}", urlencoding::encode(code))
        }
        _ => "/device".to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct DevicePageQuery {
    user_code: Option<String>,
}

/// GET /device - Device verification page
async fn device_page(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DevicePageQuery>,
) -> Response {
    let user = match session::authenticated_user(&state.db, &headers).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return login_redirect(&device_page_path(query.user_code.as_deref())).into_response()
        }
        Err(e) => return DeviceFlowError::from(e).into_response(),
    };

    let prefilled = query.user_code.as_deref().unwrap_or("");

    let details = match query.user_code.as_deref() {
        Some(code) if !code.trim().is_empty() => {
            match state.device_flow.pending_by_user_code(code).await {
                Ok(record) => {
                    let info: ClientInfo = record
                        .client_info
                        .as_deref()
                        .and_then(|s| serde_json::from_str(s).ok())
                        .unwrap_or_default();
                    format!(
                        r#"<div class="device-info"><dl>
            <dt>IP Address:</dt><dd>{}</dd>
            <dt>User Agent:</dt><dd>{}</dd>
        </dl></div>"#,
                        html_escape(info.ip_address.as_deref().unwrap_or("Unknown")),
                        html_escape(info.user_agent.as_deref().unwrap_or("Unknown")),
                    )
                }
                Err(e @ DeviceFlowError::Storage(_)) => return e.into_response(),
                Err(e) => format!(r#"<p class="error">{}</p>"#, html_escape(&e.to_string())),
            }
        }
        _ => String::new(),
    };

    page(
        "Connect a device",
        &format!(
            r#"<p>Signed in as <strong>{username}</strong>. Enter the code shown in your terminal.</p>
        {details}
        <form method="POST" action="/device/approve">
            <input type="text" name="user_code" placeholder="XXXX-XXXX" value="{code}" maxlength="9" required autofocus>
            <button type="submit">Approve</button>
        </form>"#,
            username = html_escape(&user.username),
            code = html_escape(prefilled),
        ),
    )
    .into_response()
}

#[derive(Debug, Deserialize)]
struct DeviceApproveForm {
    user_code: String,
}

/// POST /device/approve - approve from the verification page
async fn device_approve_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<DeviceApproveForm>,
) -> Response {
    let user = match session::authenticated_user(&state.db, &headers).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return login_redirect(&device_page_path(Some(&form.user_code))).into_response()
        }
        Err(e) => return DeviceFlowError::from(e).into_response(),
    };

    match state.device_flow.approve(&form.user_code, &user.subject).await {
        Ok(_) => page(
            "Device approved",
            r#"<p class="success">You can now return to your terminal and continue.</p>"#,
        )
        .into_response(),
        Err(e) => {
            let status = error_status(&e);
            let message = match e {
                DeviceFlowError::InvalidCode => {
                    "That code is not valid. Check your terminal and try again."
                }
                DeviceFlowError::AlreadyApproved => "That code has already been approved.",
                DeviceFlowError::Expired => {
                    "That code has expired. Start the login again from your terminal."
                }
                DeviceFlowError::MissingField(_) => "Please enter the code shown in your terminal.",
                other => {
                    tracing::error!(error = %other, "device approval failed");
                    "Something went wrong. Please try again."
                }
            };
            (
                status,
                page(
                    "Device not approved",
                    &format!(r#"<p class="error">{}</p>"#, html_escape(message)),
                ),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginQuery {
    return_to: Option<String>,
    error: Option<String>,
}

/// GET /login - Login page
async fn login_page(Query(q): Query<LoginQuery>) -> Html<String> {
    let error_html = q
        .error
        .map(|err| format!(r#"<p class="error">{}</p>"#, html_escape(&err)))
        .unwrap_or_default();
    let return_to = safe_return_to(q.return_to.as_deref());

    page(
        "Sign in",
        &format!(
            r#"{error_html}
        <form method="POST" action="/login">
            <input type="hidden" name="return_to" value="{return_to}">
            <input type="text" name="username" placeholder="Username" required autofocus>
            <input type="password" name="password" placeholder="Password" required>
            <button type="submit">Sign in</button>
        </form>"#,
            return_to = html_escape(&return_to),
        ),
    )
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    username: String,
    password: String,
    return_to: Option<String>,
}

/// POST /login - verify credentials and start a browser session
async fn login_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    let return_to = safe_return_to(form.return_to.as_deref());
    let fail = |message: &str| {
        Redirect::to(&format!(
            "/login?error={}&return_to={}",
            urlencoding::encode(message),
            urlencoding::encode(&return_to)
        ))
        .into_response()
    };

    let subject =
        match storage::verify_user_password(&state.db, &form.username, &form.password).await {
            Ok(Some(sub)) => sub,
            Ok(None) => {
                tracing::warn!(username = %form.username, "failed login");
                return fail("Invalid username or password");
            }
            Err(e) => {
                tracing::error!(error = %e, "login lookup failed");
                return fail("Login failed");
            }
        };

    let info = client_info(&headers);
    let now = chrono::Utc::now().timestamp_millis();
    let session = match storage::create_session(
        &state.db,
        &subject,
        now,
        state.settings.session.ttl_secs,
        info.user_agent,
        info.ip_address,
    )
    .await
    {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to create session");
            return fail("Failed to create session");
        }
    };

    let cookie = SessionCookie::new(session.session_id).to_cookie_header(&state.settings);
    (
        StatusCode::SEE_OTHER,
        [(header::SET_COOKIE, cookie), (header::LOCATION, return_to)],
    )
        .into_response()
}

/// GET /logout - end the browser session
async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(cookie) = SessionCookie::from_headers(&headers) {
        if let Err(e) = storage::delete_session(&state.db, &cookie.session_id).await {
            tracing::warn!(error = %e, "failed to delete session");
        }
    }

    (
        StatusCode::SEE_OTHER,
        [
            (header::SET_COOKIE, SessionCookie::delete_cookie_header()),
            (header::LOCATION, "/login".to_string()),
        ],
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_return_to() {
        assert_eq!(safe_return_to(Some("/device?user_code=X")), "/device?user_code=X");
        assert_eq!(safe_return_to(Some("//evil.example.com")), "/device");
        assert_eq!(safe_return_to(Some("https://evil.example.com")), "/device");
        assert_eq!(safe_return_to(Some("/\\evil.example.com")), "/device");
        assert_eq!(safe_return_to(None), "/device");
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(
            html_escape(r#"<script>alert("x")</script>"#),
            "&lt;script&gt;alert(&quot;x&quot;)&lt;/script&gt;"
        );
    }

    #[test]
    fn test_client_info_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("stashpoint-cli/0.1"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );

        let info = client_info(&headers);
        assert_eq!(info.user_agent.as_deref(), Some("stashpoint-cli/0.1"));
        assert_eq!(info.ip_address.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn test_json_body_defaults_on_garbage() {
        let req: TokenRequest = json_body(&Bytes::from_static(b"not json"));
        assert!(req.device_code.is_none());

        let req: TokenRequest = json_body(&Bytes::from_static(br#"{"deviceCode":"abc"}"#));
        assert_eq!(req.device_code.as_deref(), Some("abc"));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            DeviceFlowError::Unauthenticated.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            DeviceFlowError::MissingField("userCode").into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DeviceFlowError::InvalidCode.into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            DeviceFlowError::AlreadyApproved.into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            DeviceFlowError::Expired.into_response().status(),
            StatusCode::CONFLICT
        );
    }
}
