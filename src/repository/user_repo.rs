//! User repository (数据库访问层)

use super::UserRepositoryTrait;
use crate::{
    error::AppError,
    models::user::{ClientMembership, NewUser, User},
};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

pub struct UserRepository {
    db: PgPool,
}

impl UserRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserRepositoryTrait for UserRepository {
    /// 根据邮箱查找用户
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, tenant_id, email, password_hash, name, role, created_at, updated_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.db)
        .await?;

        Ok(user)
    }

    /// 根据 ID 查找用户
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, tenant_id, email, password_hash, name, role, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(user)
    }

    /// 获取用户在各客户下的角色
    async fn find_memberships(&self, user_id: Uuid) -> Result<Vec<ClientMembership>, AppError> {
        let memberships = sqlx::query_as::<_, ClientMembership>(
            r#"
            SELECT
                cm.client_id,
                c.name AS client_name,
                cm.role
            FROM client_memberships cm
            JOIN clients c ON cm.client_id = c.id
            WHERE cm.user_id = $1
            ORDER BY c.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(memberships)
    }

    /// 创建用户
    async fn create(&self, new_user: &NewUser) -> Result<User, AppError> {
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, tenant_id, email, password_hash, name, role)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, tenant_id, email, password_hash, name, role, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new_user.tenant_id)
        .bind(&new_user.email)
        .bind(&new_user.password_hash)
        .bind(&new_user.name)
        .bind(&new_user.role)
        .fetch_one(&self.db)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                AppError::Conflict("Email already registered".to_string())
            }
            _ => AppError::Database(e),
        })
    }

    /// 更新姓名和/或密码
    async fn update_profile(
        &self,
        id: Uuid,
        name: Option<&str>,
        password_hash: Option<&str>,
    ) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET
                name = COALESCE($2, name),
                password_hash = COALESCE($3, password_hash),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, tenant_id, email, password_hash, name, role, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(password_hash)
        .fetch_optional(&self.db)
        .await?;

        Ok(user)
    }
}
