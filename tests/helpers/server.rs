use super::{ManualClock, TestDb};
use sea_orm::DatabaseConnection;
use stashpoint::settings::Settings;
use stashpoint::web::{self, AppState};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// In-process server on an ephemeral port, backed by a fresh database.
pub struct TestServer {
    base_url: String,
    db: TestDb,
    pub clock: Arc<ManualClock>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let db = TestDb::new().await;
        let clock = ManualClock::starting_now();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("No local addr");

        let mut settings = Settings::default();
        settings.server.host = addr.ip().to_string();
        settings.server.port = addr.port();
        settings.device_flow.poll_interval_secs = 1;

        let state = AppState::new(settings, db.connection().clone(), clock.clone());
        let app = web::router(state);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("Test server failed");
        });

        Self {
            base_url: format!("http://{}", addr),
            db,
            clock,
            handle,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn db(&self) -> &DatabaseConnection {
        self.db.connection()
    }

    /// Browser-like client: keeps cookies, does not follow redirects.
    pub fn browser() -> reqwest::Client {
        reqwest::Client::builder()
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("Failed to build browser client")
    }

    /// Sign `browser` in through the login form.
    pub async fn login(&self, browser: &reqwest::Client, username: &str, password: &str) {
        let response = browser
            .post(self.url("/login"))
            .form(&[
                ("username", username),
                ("password", password),
                ("return_to", "/device"),
            ])
            .send()
            .await
            .expect("Failed to post login form");

        assert_eq!(response.status(), reqwest::StatusCode::SEE_OTHER);
        assert_eq!(
            response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok()),
            Some("/device")
        );
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
