//! Repository layer
//!
//! Services depend on the traits below; `Storage` bundles one implementation
//! of each (Postgres in production, in-memory for local runs and tests).

pub mod memory;
pub mod refresh_token_repo;
pub mod user_repo;

pub use memory::MemoryRepository;
pub use refresh_token_repo::RefreshTokenRepository;
pub use user_repo::UserRepository;

use crate::{
    error::AppError,
    models::{
        auth::{RefreshToken, RefreshTokenCandidate},
        user::{ClientMembership, NewUser, User},
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

pub type DynUserRepository = Arc<dyn UserRepositoryTrait + Send + Sync>;
pub type DynRefreshTokenRepository = Arc<dyn RefreshTokenRepositoryTrait + Send + Sync>;

#[async_trait]
pub trait UserRepositoryTrait {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AppError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AppError>;

    /// Role-per-client associations of the user
    async fn find_memberships(&self, user_id: Uuid) -> Result<Vec<ClientMembership>, AppError>;

    /// Insert a user; a duplicate email is a `Conflict` regardless of tenant
    async fn create(&self, new_user: &NewUser) -> Result<User, AppError>;

    /// Update name and/or password hash; `None` if the user no longer exists
    async fn update_profile(
        &self,
        id: Uuid,
        name: Option<&str>,
        password_hash: Option<&str>,
    ) -> Result<Option<User>, AppError>;
}

/// Every method is a single statement; no method spans several.
#[async_trait]
pub trait RefreshTokenRepositoryTrait {
    async fn store(&self, token: &RefreshToken) -> Result<(), AppError>;

    /// Records with `expires_at > now` sharing `lookup_key`, with their owners
    async fn find_active_candidates(
        &self,
        lookup_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshTokenCandidate>, AppError>;

    /// Delete one still-active record; `true` only for the caller that removed it
    async fn consume(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError>;

    async fn delete_by_user(&self, user_id: Uuid) -> Result<u64, AppError>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

/// Repositories used by the services
#[derive(Clone)]
pub struct Storage {
    pub users: DynUserRepository,
    pub refresh_tokens: DynRefreshTokenRepository,
    /// Present for the Postgres backend, used by readiness checks
    pub pool: Option<PgPool>,
}

impl Storage {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            users: Arc::new(UserRepository::new(pool.clone())),
            refresh_tokens: Arc::new(RefreshTokenRepository::new(pool.clone())),
            pool: Some(pool),
        }
    }

    pub fn memory(repo: Arc<MemoryRepository>) -> Self {
        Self {
            users: repo.clone(),
            refresh_tokens: repo,
            pool: None,
        }
    }
}
