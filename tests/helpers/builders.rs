use stashpoint::storage;
use sea_orm::DatabaseConnection;

/// Builder for creating test users
pub struct UserBuilder {
    username: String,
    password: String,
    email: Option<String>,
    enabled: bool,
}

impl UserBuilder {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            password: "password123".to_string(),
            email: None,
            enabled: true,
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> storage::User {
        let user = storage::create_user(db, &self.username, &self.password, self.email)
            .await
            .expect("Failed to create test user");

        if !self.enabled {
            storage::set_user_enabled(db, &user.subject, false)
                .await
                .expect("Failed to disable user");

            storage::get_user_by_subject(db, &user.subject)
                .await
                .expect("Failed to get updated user")
                .expect("User not found")
        } else {
            user
        }
    }
}

/// Builder for creating test sessions
pub struct SessionBuilder {
    subject: String,
    started_at: i64,
    ttl: i64,
}

impl SessionBuilder {
    pub fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            started_at: chrono::Utc::now().timestamp_millis(),
            ttl: 3600, // 1 hour
        }
    }

    pub fn with_started_at(mut self, started_at: i64) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> storage::Session {
        storage::create_session(db, &self.subject, self.started_at, self.ttl, None, None)
            .await
            .expect("Failed to create test session")
    }
}
