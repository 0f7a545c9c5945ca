//! Refresh token repository (刷新令牌数据访问)

use super::RefreshTokenRepositoryTrait;
use crate::{
    error::AppError,
    models::{
        auth::{RefreshToken, RefreshTokenCandidate},
        user::User,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

pub struct RefreshTokenRepository {
    db: PgPool,
}

impl RefreshTokenRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// 刷新令牌与所属用户的联表行
#[derive(sqlx::FromRow)]
struct CandidateRow {
    id: Uuid,
    user_id: Uuid,
    token_hash: String,
    lookup_key: String,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    tenant_id: Uuid,
    email: String,
    password_hash: String,
    name: String,
    role: String,
    user_created_at: DateTime<Utc>,
    user_updated_at: DateTime<Utc>,
}

impl From<CandidateRow> for RefreshTokenCandidate {
    fn from(row: CandidateRow) -> Self {
        Self {
            token: RefreshToken {
                id: row.id,
                user_id: row.user_id,
                token_hash: row.token_hash,
                lookup_key: row.lookup_key,
                expires_at: row.expires_at,
                created_at: row.created_at,
            },
            user: User {
                id: row.user_id,
                tenant_id: row.tenant_id,
                email: row.email,
                password_hash: row.password_hash,
                name: row.name,
                role: row.role,
                created_at: row.user_created_at,
                updated_at: row.user_updated_at,
            },
        }
    }
}

#[async_trait]
impl RefreshTokenRepositoryTrait for RefreshTokenRepository {
    /// 存储刷新令牌
    async fn store(&self, token: &RefreshToken) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (id, user_id, token_hash, lookup_key, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(&token.token_hash)
        .bind(&token.lookup_key)
        .bind(token.expires_at)
        .bind(token.created_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// 查找未过期的候选令牌（含所属用户）
    async fn find_active_candidates(
        &self,
        lookup_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshTokenCandidate>, AppError> {
        let rows = sqlx::query_as::<_, CandidateRow>(
            r#"
            SELECT
                rt.id,
                rt.user_id,
                rt.token_hash,
                rt.lookup_key,
                rt.expires_at,
                rt.created_at,
                u.tenant_id,
                u.email,
                u.password_hash,
                u.name,
                u.role,
                u.created_at AS user_created_at,
                u.updated_at AS user_updated_at
            FROM refresh_tokens rt
            JOIN users u ON rt.user_id = u.id
            WHERE rt.lookup_key = $1
                AND rt.expires_at > $2
            "#,
        )
        .bind(lookup_key)
        .bind(now)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(RefreshTokenCandidate::from).collect())
    }

    /// 消费（删除）一条仍有效的令牌
    async fn consume(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE id = $1 AND expires_at > $2")
            .bind(id)
            .bind(now)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// 删除用户的所有刷新令牌
    async fn delete_by_user(&self, user_id: Uuid) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }

    /// 清理过期的刷新令牌
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}
