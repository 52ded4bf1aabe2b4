use crate::entities;
use crate::errors::StashError;
use crate::settings::Database as DbCfg;
use base64ct::Encoding;
use migration::{Migrator, MigratorTrait};
use rand::{Rng, RngCore};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix carried by every minted API key.
pub const API_KEY_PREFIX: &str = "stp_";

/// Attempts at finding an unused device/user code pair before giving up.
const CODE_GENERATION_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub subject: String,
    pub username: String,
    pub password_hash: String,
    pub email: Option<String>,
    pub created_at: i64,
    pub enabled: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub subject: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceCodeStatus {
    Pending,
    Approved,
}

impl DeviceCodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCodeStatus::Pending => "pending",
            DeviceCodeStatus::Approved => "approved",
        }
    }

    fn parse(value: &str) -> Result<Self, StashError> {
        match value {
            "pending" => Ok(DeviceCodeStatus::Pending),
            "approved" => Ok(DeviceCodeStatus::Approved),
            other => Err(StashError::Other(format!(
                "Unknown device code status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub status: DeviceCodeStatus,
    pub api_key: Option<String>,
    pub approved_by: Option<String>,
    pub client_info: Option<String>, // JSON: {ip_address, user_agent}
    /// Unix milliseconds
    pub created_at: i64,
    /// Unix milliseconds
    pub expires_at: i64,
    pub approved_at: Option<i64>,
}

impl DeviceCode {
    /// Expiry is derived from the wall clock, never stored.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

impl TryFrom<entities::device_code::Model> for DeviceCode {
    type Error = StashError;

    fn try_from(dc: entities::device_code::Model) -> Result<Self, Self::Error> {
        Ok(DeviceCode {
            status: DeviceCodeStatus::parse(&dc.status)?,
            device_code: dc.device_code,
            user_code: dc.user_code,
            api_key: dc.api_key,
            approved_by: dc.approved_by,
            client_info: dc.client_info,
            created_at: dc.created_at,
            expires_at: dc.expires_at,
            approved_at: dc.approved_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub key_id: String,
    pub prefix: String,
    pub subject: String,
    pub device_code: Option<String>,
    pub created_at: i64,
}

/// A freshly minted credential. `secret` is only ever available here.
#[derive(Debug, Clone)]
pub struct MintedApiKey {
    pub key: ApiKey,
    pub secret: String,
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, StashError> {
    let db = Database::connect(&cfg.url).await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

fn random_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

/// Alphabet used for user codes: consonants only, no ambiguous characters.
pub const USER_CODE_ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ";

/// Generate 8-character base-20 user code in format XXXX-XXXX
/// Entropy: 20^8 = ~43 bits
fn generate_user_code() -> String {
    let mut rng = rand::thread_rng();
    let mut code = String::with_capacity(9);

    for i in 0..8 {
        if i == 4 {
            code.push('-');
        }
        let idx = rng.gen_range(0..USER_CODE_ALPHABET.len());
        code.push(USER_CODE_ALPHABET[idx] as char);
    }

    code
}

fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "{}{}",
        API_KEY_PREFIX,
        base64ct::Base64UrlUnpadded::encode_string(&bytes)
    )
}

fn hash_api_key(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    format!("{:x}", digest)
}

fn is_unique_violation(err: &sea_orm::DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

// User management functions

pub async fn create_user(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
    email: Option<String>,
) -> Result<User, StashError> {
    use argon2::password_hash::{rand_core::OsRng, SaltString};
    use argon2::{Argon2, PasswordHasher};

    let subject = random_id();
    let created_at = chrono::Utc::now().timestamp_millis();

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| StashError::Other(format!("Password hashing failed: {}", e)))?
        .to_string();

    let user = entities::user::ActiveModel {
        subject: Set(subject.clone()),
        username: Set(username.to_string()),
        password_hash: Set(password_hash.clone()),
        email: Set(email.clone()),
        created_at: Set(created_at),
        enabled: Set(1),
    };

    user.insert(db).await?;

    Ok(User {
        subject,
        username: username.to_string(),
        password_hash,
        email,
        created_at,
        enabled: 1,
    })
}

fn user_from_model(model: entities::user::Model) -> User {
    User {
        subject: model.subject,
        username: model.username,
        password_hash: model.password_hash,
        email: model.email,
        created_at: model.created_at,
        enabled: model.enabled,
    }
}

pub async fn get_user_by_username(
    db: &DatabaseConnection,
    username: &str,
) -> Result<Option<User>, StashError> {
    use entities::user::{Column, Entity};

    let model = Entity::find()
        .filter(Column::Username.eq(username))
        .one(db)
        .await?;

    Ok(model.map(user_from_model))
}

pub async fn get_user_by_subject(
    db: &DatabaseConnection,
    subject: &str,
) -> Result<Option<User>, StashError> {
    use entities::user::{Column, Entity};

    let model = Entity::find()
        .filter(Column::Subject.eq(subject))
        .one(db)
        .await?;

    Ok(model.map(user_from_model))
}

/// Returns the user's subject when the password matches an enabled account.
pub async fn verify_user_password(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
) -> Result<Option<String>, StashError> {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};

    let user = match get_user_by_username(db, username).await? {
        Some(u) if u.enabled == 1 => u,
        _ => return Ok(None),
    };

    let parsed_hash = PasswordHash::new(&user.password_hash)
        .map_err(|e| StashError::Other(format!("Invalid password hash: {}", e)))?;

    if Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
    {
        Ok(Some(user.subject))
    } else {
        Ok(None)
    }
}

pub async fn set_user_enabled(
    db: &DatabaseConnection,
    subject: &str,
    enabled: bool,
) -> Result<(), StashError> {
    use entities::user::{Column, Entity};

    let user = Entity::find()
        .filter(Column::Subject.eq(subject))
        .one(db)
        .await?
        .ok_or_else(|| StashError::Other(format!("User not found: {}", subject)))?;

    let mut active: entities::user::ActiveModel = user.into();
    active.enabled = Set(if enabled { 1 } else { 0 });
    active.update(db).await?;

    Ok(())
}

// Session management functions

pub async fn create_session(
    db: &DatabaseConnection,
    subject: &str,
    started_at: i64,
    ttl_secs: i64,
    user_agent: Option<String>,
    ip_address: Option<String>,
) -> Result<Session, StashError> {
    let session_id = random_id();
    let expires_at = started_at + ttl_secs * 1000;

    let session = entities::session::ActiveModel {
        session_id: Set(session_id.clone()),
        subject: Set(subject.to_string()),
        created_at: Set(started_at),
        expires_at: Set(expires_at),
        user_agent: Set(user_agent.clone()),
        ip_address: Set(ip_address.clone()),
    };

    session.insert(db).await?;

    Ok(Session {
        session_id,
        subject: subject.to_string(),
        created_at: started_at,
        expires_at,
        user_agent,
        ip_address,
    })
}

pub async fn get_session(
    db: &DatabaseConnection,
    session_id: &str,
) -> Result<Option<Session>, StashError> {
    use entities::session::{Column, Entity};

    if let Some(model) = Entity::find()
        .filter(Column::SessionId.eq(session_id))
        .one(db)
        .await?
    {
        let now = chrono::Utc::now().timestamp_millis();
        if now > model.expires_at {
            return Ok(None);
        }

        Ok(Some(Session {
            session_id: model.session_id,
            subject: model.subject,
            created_at: model.created_at,
            expires_at: model.expires_at,
            user_agent: model.user_agent,
            ip_address: model.ip_address,
        }))
    } else {
        Ok(None)
    }
}

pub async fn delete_session(db: &DatabaseConnection, session_id: &str) -> Result<(), StashError> {
    use entities::session::{Column, Entity};

    Entity::delete_many()
        .filter(Column::SessionId.eq(session_id))
        .exec(db)
        .await?;

    Ok(())
}

// Device authorization functions

/// Create a new pending device code pair expiring at `expires_at` (unix millis).
///
/// A user-code collision with an existing row regenerates the pair; other
/// storage failures are returned as-is.
pub async fn create_device_code(
    db: &DatabaseConnection,
    client_info: Option<String>,
    now: i64,
    expires_at: i64,
) -> Result<DeviceCode, StashError> {
    insert_device_code_with(db, client_info, now, expires_at, generate_user_code).await
}

async fn insert_device_code_with(
    db: &DatabaseConnection,
    client_info: Option<String>,
    now: i64,
    expires_at: i64,
    mut next_user_code: impl FnMut() -> String,
) -> Result<DeviceCode, StashError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let device_code = random_id();
        let user_code = next_user_code();

        let model = entities::device_code::ActiveModel {
            device_code: Set(device_code.clone()),
            user_code: Set(user_code.clone()),
            status: Set(DeviceCodeStatus::Pending.as_str().to_string()),
            api_key: Set(None),
            approved_by: Set(None),
            client_info: Set(client_info.clone()),
            created_at: Set(now),
            expires_at: Set(expires_at),
            approved_at: Set(None),
        };

        match entities::device_code::Entity::insert(model).exec(db).await {
            Ok(_) => {
                return Ok(DeviceCode {
                    device_code,
                    user_code,
                    status: DeviceCodeStatus::Pending,
                    api_key: None,
                    approved_by: None,
                    client_info,
                    created_at: now,
                    expires_at,
                    approved_at: None,
                })
            }
            Err(e) if is_unique_violation(&e) && attempt < CODE_GENERATION_ATTEMPTS => {
                tracing::warn!(attempt, "device code collision, regenerating");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Get device code by device_code. Expired rows are returned; callers decide.
pub async fn get_device_code(
    db: &DatabaseConnection,
    device_code: &str,
) -> Result<Option<DeviceCode>, StashError> {
    use entities::device_code::{Column, Entity};

    Entity::find()
        .filter(Column::DeviceCode.eq(device_code))
        .one(db)
        .await?
        .map(DeviceCode::try_from)
        .transpose()
}

/// Get device code by user_code. Expired rows are returned; callers decide.
pub async fn get_device_code_by_user_code(
    db: &DatabaseConnection,
    user_code: &str,
) -> Result<Option<DeviceCode>, StashError> {
    use entities::device_code::{Column, Entity};

    Entity::find()
        .filter(Column::UserCode.eq(user_code))
        .one(db)
        .await?
        .map(DeviceCode::try_from)
        .transpose()
}

/// Approve a pending, unexpired device code and mint its API key.
///
/// The pending -> approved transition is a single conditional UPDATE, and the
/// credential row is written in the same transaction. Returns `None` when no
/// row qualified (unknown, already approved, or expired); nothing is written
/// in that case.
pub async fn approve_device_code(
    db: &DatabaseConnection,
    user_code: &str,
    subject: &str,
    now: i64,
) -> Result<Option<MintedApiKey>, StashError> {
    use entities::device_code::{Column, Entity};

    let txn = db.begin().await?;

    let result = Entity::update_many()
        .col_expr(
            Column::Status,
            Expr::value(DeviceCodeStatus::Approved.as_str()),
        )
        .col_expr(Column::ApprovedBy, Expr::value(subject))
        .col_expr(Column::ApprovedAt, Expr::value(now))
        .filter(Column::UserCode.eq(user_code))
        .filter(Column::Status.eq(DeviceCodeStatus::Pending.as_str()))
        .filter(Column::ExpiresAt.gt(now))
        .exec(&txn)
        .await?;

    if result.rows_affected != 1 {
        txn.rollback().await?;
        return Ok(None);
    }

    let record = Entity::find()
        .filter(Column::UserCode.eq(user_code))
        .one(&txn)
        .await?
        .ok_or_else(|| StashError::Other("approved device code vanished".to_string()))?;

    let minted = mint_api_key(&txn, subject, Some(&record.device_code), now).await?;

    Entity::update_many()
        .col_expr(Column::ApiKey, Expr::value(minted.secret.clone()))
        .filter(Column::DeviceCode.eq(record.device_code.as_str()))
        .exec(&txn)
        .await?;

    txn.commit().await?;

    Ok(Some(minted))
}

// API key functions

/// Mint an API key for `subject`, optionally bound to the handshake that produced it.
///
/// Only the SHA-256 hash and a display prefix are stored in `api_keys`.
pub async fn mint_api_key<C: ConnectionTrait>(
    conn: &C,
    subject: &str,
    device_code: Option<&str>,
    now: i64,
) -> Result<MintedApiKey, StashError> {
    let secret = generate_api_key();
    let key_id = random_id();
    let prefix: String = secret.chars().take(API_KEY_PREFIX.len() + 8).collect();

    let model = entities::api_key::ActiveModel {
        key_id: Set(key_id.clone()),
        key_hash: Set(hash_api_key(&secret)),
        prefix: Set(prefix.clone()),
        subject: Set(subject.to_string()),
        device_code: Set(device_code.map(String::from)),
        created_at: Set(now),
    };

    entities::api_key::Entity::insert(model).exec(conn).await?;

    Ok(MintedApiKey {
        key: ApiKey {
            key_id,
            prefix,
            subject: subject.to_string(),
            device_code: device_code.map(String::from),
            created_at: now,
        },
        secret,
    })
}

fn api_key_from_model(model: entities::api_key::Model) -> ApiKey {
    ApiKey {
        key_id: model.key_id,
        prefix: model.prefix,
        subject: model.subject,
        device_code: model.device_code,
        created_at: model.created_at,
    }
}

/// Resolve a presented API key secret to its record.
pub async fn find_api_key(
    db: &DatabaseConnection,
    secret: &str,
) -> Result<Option<ApiKey>, StashError> {
    use entities::api_key::{Column, Entity};

    let model = Entity::find()
        .filter(Column::KeyHash.eq(hash_api_key(secret)))
        .one(db)
        .await?;

    Ok(model.map(api_key_from_model))
}

pub async fn list_api_keys_by_subject(
    db: &DatabaseConnection,
    subject: &str,
) -> Result<Vec<ApiKey>, StashError> {
    use entities::api_key::{Column, Entity};

    let models = Entity::find()
        .filter(Column::Subject.eq(subject))
        .order_by_asc(Column::CreatedAt)
        .all(db)
        .await?;

    Ok(models.into_iter().map(api_key_from_model).collect())
}
