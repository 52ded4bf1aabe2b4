use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use tempfile::NamedTempFile;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        // Create temporary SQLite database file
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        // Connect to database
        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        // Run migrations
        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

/// Create a test user for testing
pub async fn seed_test_user(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
) -> stashpoint::storage::User {
    stashpoint::storage::create_user(db, username, password, None)
        .await
        .expect("Failed to create test user")
}

/// Number of API key rows owned by `subject`
pub async fn api_key_count(db: &DatabaseConnection, subject: &str) -> usize {
    stashpoint::storage::list_api_keys_by_subject(db, subject)
        .await
        .expect("Failed to list api keys")
        .len()
}
