use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;

use super::{
    generate_token, remaining_after, require_token, require_ttl, IssuedToken, LedgerError,
    TokenInfo, TokenLedger, TokenRow, ValidationResult, DEFAULT_ALLOTMENT,
};

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
    allotment: i64,
}

#[derive(sqlx::FromRow)]
struct PgTokenRow {
    id: i64,
    token: String,
    quota_left: i64,
    expires_at: DateTime<Utc>,
    permissions: Json<Vec<String>>,
    created_at: DateTime<Utc>,
}

impl From<PgTokenRow> for TokenRow {
    fn from(row: PgTokenRow) -> Self {
        Self {
            serial: row.id,
            token: row.token,
            quota_left: row.quota_left,
            expires_at: row.expires_at,
            permissions: row.permissions.0,
            created_at: row.created_at,
        }
    }
}

impl PgLedger {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(std::time::Duration::from_secs(3))
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            allotment: DEFAULT_ALLOTMENT,
        }
    }

    pub fn with_allotment(mut self, allotment: i64) -> Self {
        self.allotment = allotment;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn find(&self, token: &str) -> Result<Option<TokenRow>, LedgerError> {
        let row = sqlx::query_as::<_, PgTokenRow>(
            "SELECT id, token, quota_left, expires_at, permissions, created_at FROM tokens WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(TokenRow::from))
    }
}

#[async_trait]
impl TokenLedger for PgLedger {
    async fn create(&self, permissions: Vec<String>, ttl_secs: i64) -> Result<IssuedToken, LedgerError> {
        let ttl = require_ttl(ttl_secs)?;
        let token = generate_token();
        let expires_at = Utc::now() + ttl;

        sqlx::query(
            r#"INSERT INTO tokens (token, quota_left, expires_at, permissions)
               VALUES ($1, $2, $3, $4)"#,
        )
        .bind(&token)
        .bind(self.allotment)
        .bind(expires_at)
        .bind(Json(permissions))
        .execute(&self.pool)
        .await?;

        Ok(IssuedToken { token, expires_at })
    }

    async fn validate(&self, token: &str) -> Result<ValidationResult, LedgerError> {
        require_token(token)?;
        match self.find(token).await? {
            Some(row) if !row.is_expired(Utc::now()) => Ok(ValidationResult {
                valid: true,
                identity: row.identity(),
                permissions: row.permissions,
            }),
            _ => Ok(ValidationResult::invalid()),
        }
    }

    async fn settle(&self, token: &str, delivered: i64) -> Result<i64, LedgerError> {
        require_token(token)?;
        if delivered < 0 {
            self.revoke(token).await?;
            return Ok(delivered);
        }

        // Row lock serializes concurrent settles on the same token.
        let mut tx = self.pool.begin().await?;
        let current = sqlx::query_scalar::<_, i64>(
            "SELECT quota_left FROM tokens WHERE token = $1 FOR UPDATE",
        )
        .bind(token)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::NotFound)?;

        let next = remaining_after(current, delivered);
        if next <= 0 {
            sqlx::query("DELETE FROM tokens WHERE token = $1")
                .bind(token)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query("UPDATE tokens SET quota_left = $2 WHERE token = $1")
                .bind(token)
                .bind(next)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(next)
    }

    async fn revoke(&self, token: &str) -> Result<bool, LedgerError> {
        require_token(token)?;
        let result = sqlx::query("DELETE FROM tokens WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn inspect(&self, token: &str) -> Result<TokenInfo, LedgerError> {
        require_token(token)?;
        self.find(token)
            .await?
            .map(TokenInfo::from)
            .ok_or(LedgerError::NotFound)
    }

    async fn purge_expired(&self) -> Result<u64, LedgerError> {
        let result = sqlx::query("DELETE FROM tokens WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
