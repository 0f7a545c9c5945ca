//! In-process repository backed by `tokio::sync::RwLock`
//!
//! Each trait method takes the lock once, which gives the same per-statement
//! atomicity the Postgres implementation relies on.

use super::{RefreshTokenRepositoryTrait, UserRepositoryTrait};
use crate::{
    error::AppError,
    models::{
        auth::{RefreshToken, RefreshTokenCandidate},
        user::{ClientMembership, NewUser, User},
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    memberships: HashMap<Uuid, Vec<ClientMembership>>,
    refresh_tokens: HashMap<Uuid, RefreshToken>,
}

#[derive(Default)]
pub struct MemoryRepository {
    state: RwLock<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a client role to a user
    pub async fn add_membership(&self, user_id: Uuid, membership: ClientMembership) {
        let mut state = self.state.write().await;
        state.memberships.entry(user_id).or_default().push(membership);
    }

    /// Stored refresh token rows of one user, expired ones included
    pub async fn refresh_tokens_for(&self, user_id: Uuid) -> Vec<RefreshToken> {
        let state = self.state.read().await;
        state
            .refresh_tokens
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn refresh_token_count(&self) -> usize {
        self.state.read().await.refresh_tokens.len()
    }
}

#[async_trait]
impl UserRepositoryTrait for MemoryRepository {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let state = self.state.read().await;
        Ok(state.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AppError> {
        Ok(self.state.read().await.users.get(&id).cloned())
    }

    async fn find_memberships(&self, user_id: Uuid) -> Result<Vec<ClientMembership>, AppError> {
        let state = self.state.read().await;
        let mut memberships = state.memberships.get(&user_id).cloned().unwrap_or_default();
        memberships.sort_by(|a, b| a.client_name.cmp(&b.client_name));
        Ok(memberships)
    }

    async fn create(&self, new_user: &NewUser) -> Result<User, AppError> {
        let mut state = self.state.write().await;

        if state.users.values().any(|u| u.email == new_user.email) {
            return Err(AppError::Conflict("Email already registered".to_string()));
        }

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            tenant_id: new_user.tenant_id,
            email: new_user.email.clone(),
            password_hash: new_user.password_hash.clone(),
            name: new_user.name.clone(),
            role: new_user.role.clone(),
            created_at: now,
            updated_at: now,
        };
        state.users.insert(user.id, user.clone());

        Ok(user)
    }

    async fn update_profile(
        &self,
        id: Uuid,
        name: Option<&str>,
        password_hash: Option<&str>,
    ) -> Result<Option<User>, AppError> {
        let mut state = self.state.write().await;

        let Some(user) = state.users.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(name) = name {
            user.name = name.to_string();
        }
        if let Some(hash) = password_hash {
            user.password_hash = hash.to_string();
        }
        user.updated_at = Utc::now();

        Ok(Some(user.clone()))
    }
}

#[async_trait]
impl RefreshTokenRepositoryTrait for MemoryRepository {
    async fn store(&self, token: &RefreshToken) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(&token.user_id) {
            return Err(AppError::Internal(format!(
                "refresh token references unknown user {}",
                token.user_id
            )));
        }
        state.refresh_tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn find_active_candidates(
        &self,
        lookup_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshTokenCandidate>, AppError> {
        let state = self.state.read().await;
        let candidates = state
            .refresh_tokens
            .values()
            .filter(|t| t.lookup_key == lookup_key && t.is_active_at(now))
            .filter_map(|t| {
                state.users.get(&t.user_id).map(|user| RefreshTokenCandidate {
                    token: t.clone(),
                    user: user.clone(),
                })
            })
            .collect();

        Ok(candidates)
    }

    async fn consume(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let mut state = self.state.write().await;
        let active = state
            .refresh_tokens
            .get(&id)
            .is_some_and(|token| token.is_active_at(now));
        if active {
            state.refresh_tokens.remove(&id);
        }
        Ok(active)
    }

    async fn delete_by_user(&self, user_id: Uuid) -> Result<u64, AppError> {
        let mut state = self.state.write().await;
        let before = state.refresh_tokens.len();
        state.refresh_tokens.retain(|_, t| t.user_id != user_id);
        Ok((before - state.refresh_tokens.len()) as u64)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.state.write().await;
        let before = state.refresh_tokens.len();
        state.refresh_tokens.retain(|_, t| t.is_active_at(now));
        Ok((before - state.refresh_tokens.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_user(email: &str) -> NewUser {
        NewUser {
            tenant_id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: "hash".to_string(),
            name: "Test".to_string(),
            role: "member".to_string(),
        }
    }

    fn token_for(user_id: Uuid, lookup_key: &str, expires_at: DateTime<Utc>) -> RefreshToken {
        RefreshToken {
            id: Uuid::new_v4(),
            user_id,
            token_hash: "hash".to_string(),
            lookup_key: lookup_key.to_string(),
            expires_at,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_email_conflicts_across_tenants() {
        let repo = MemoryRepository::new();
        repo.create(&new_user("a@b.com")).await.unwrap();

        let err = repo.create(&new_user("a@b.com")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_candidates_exclude_expired_and_other_keys() {
        let repo = MemoryRepository::new();
        let user = repo.create(&new_user("a@b.com")).await.unwrap();
        let now = Utc::now();

        repo.store(&token_for(user.id, "k1", now + Duration::days(7))).await.unwrap();
        repo.store(&token_for(user.id, "k1", now - Duration::seconds(1))).await.unwrap();
        repo.store(&token_for(user.id, "k2", now + Duration::days(7))).await.unwrap();

        let candidates = repo.find_active_candidates("k1", now).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].user.id, user.id);
    }

    #[tokio::test]
    async fn test_consume_succeeds_once() {
        let repo = MemoryRepository::new();
        let user = repo.create(&new_user("a@b.com")).await.unwrap();
        let token = token_for(user.id, "k1", Utc::now() + Duration::days(7));
        repo.store(&token).await.unwrap();

        assert!(repo.consume(token.id, Utc::now()).await.unwrap());
        assert!(!repo.consume(token.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_by_user_is_idempotent() {
        let repo = MemoryRepository::new();
        let user = repo.create(&new_user("a@b.com")).await.unwrap();
        let other = repo.create(&new_user("c@d.com")).await.unwrap();
        let expires = Utc::now() + Duration::days(7);
        repo.store(&token_for(user.id, "k1", expires)).await.unwrap();
        repo.store(&token_for(user.id, "k2", expires)).await.unwrap();
        repo.store(&token_for(other.id, "k3", expires)).await.unwrap();

        assert_eq!(repo.delete_by_user(user.id).await.unwrap(), 2);
        assert_eq!(repo.delete_by_user(user.id).await.unwrap(), 0);
        assert_eq!(repo.refresh_token_count().await, 1);
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let repo = MemoryRepository::new();
        let user = repo.create(&new_user("a@b.com")).await.unwrap();
        let now = Utc::now();
        repo.store(&token_for(user.id, "k1", now - Duration::hours(1))).await.unwrap();
        repo.store(&token_for(user.id, "k2", now + Duration::hours(1))).await.unwrap();

        assert_eq!(repo.delete_expired(now).await.unwrap(), 1);
        assert_eq!(repo.refresh_tokens_for(user.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_update_profile_missing_user() {
        let repo = MemoryRepository::new();
        let updated = repo.update_profile(Uuid::new_v4(), Some("x"), None).await.unwrap();
        assert!(updated.is_none());
    }
}
