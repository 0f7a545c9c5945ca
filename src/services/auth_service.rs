//! 认证服务：登录、令牌刷新（轮换）、登出、个人资料

use crate::{
    auth::{jwt::JwtService, password::PasswordHasher, refresh},
    config::{AppConfig, SessionPolicy},
    error::{AppError, AuthFailure},
    models::{
        auth::{RefreshToken, TokenPair},
        user::{SessionUser, UpdateMeRequest, UserProfile},
    },
    repository::{DynRefreshTokenRepository, DynUserRepository, Storage},
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

pub struct AuthService {
    users: DynUserRepository,
    refresh_tokens: DynRefreshTokenRepository,
    jwt_service: Arc<JwtService>,
    password_hasher: PasswordHasher,
    token_hasher: PasswordHasher,
    config: Arc<AppConfig>,
    /// Verified against when the email is unknown, so both failure paths cost one hash
    dummy_password_hash: String,
}

impl AuthService {
    pub fn new(
        storage: &Storage,
        jwt_service: Arc<JwtService>,
        config: Arc<AppConfig>,
    ) -> Result<Self, AppError> {
        let password_hasher = PasswordHasher::new(config.security.password_hash)?;
        let token_hasher = PasswordHasher::new(config.security.refresh_token_hash)?;
        let dummy_password_hash = password_hasher.hash(&refresh::generate_refresh_token())?;

        Ok(Self {
            users: storage.users.clone(),
            refresh_tokens: storage.refresh_tokens.clone(),
            jwt_service,
            password_hasher,
            token_hasher,
            config,
            dummy_password_hash,
        })
    }

    /// Hasher configured for user passwords
    pub fn password_hasher(&self) -> &PasswordHasher {
        &self.password_hasher
    }

    /// 校验邮箱和密码
    ///
    /// Unknown email and wrong password both yield `Ok(None)`.
    pub async fn validate_credential(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<SessionUser>, AppError> {
        let Some(user) = self.users.find_by_email(email).await? else {
            let _ = self.password_hasher.verify(password, &self.dummy_password_hash);
            return Ok(None);
        };

        // an unparsable stored hash counts as a mismatch
        if self
            .password_hasher
            .verify(password, &user.password_hash)
            .unwrap_or(false)
        {
            Ok(Some(SessionUser::from(user)))
        } else {
            Ok(None)
        }
    }

    /// 用户登录：校验凭据并签发令牌对
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<TokenPair, AppError> {
        match self.validate_credential(email, password).await? {
            Some(user) => {
                let pair = self.login(&user).await?;
                metrics::counter!("auth_login_total", "result" => "success").increment(1);
                tracing::info!(user_id = %user.id, tenant_id = %user.tenant_id, "User logged in");
                Ok(pair)
            }
            None => {
                metrics::counter!("auth_login_total", "result" => "failure").increment(1);
                Err(AppError::Unauthorized(AuthFailure::InvalidCredential))
            }
        }
    }

    /// Issue a token pair for an already authenticated user
    pub async fn login(&self, user: &SessionUser) -> Result<TokenPair, AppError> {
        let access_token = self.jwt_service.generate_access_token(user)?;

        let raw_refresh_token = refresh::generate_refresh_token();
        let now = Utc::now();
        let record = RefreshToken {
            id: Uuid::new_v4(),
            user_id: user.id,
            token_hash: self.token_hasher.hash(&raw_refresh_token)?,
            lookup_key: refresh::lookup_key(&raw_refresh_token),
            expires_at: now + Duration::seconds(self.config.security.refresh_token_exp_secs as i64),
            created_at: now,
        };
        self.refresh_tokens.store(&record).await?;

        Ok(TokenPair {
            access_token,
            refresh_token: raw_refresh_token,
            expires_in: self.jwt_service.access_token_exp_secs(),
        })
    }

    /// 刷新令牌
    ///
    /// The matched record is consumed before anything else is written; a
    /// concurrent refresh with the same token finds nothing left to consume
    /// and is rejected.
    pub async fn refresh_token(&self, raw_token: &str) -> Result<TokenPair, AppError> {
        let result = self.rotate(raw_token).await;
        let outcome = if result.is_ok() { "success" } else { "failure" };
        metrics::counter!("auth_refresh_total", "result" => outcome).increment(1);
        result
    }

    async fn rotate(&self, raw_token: &str) -> Result<TokenPair, AppError> {
        let rejected = || AppError::Unauthorized(AuthFailure::InvalidOrExpiredRefreshToken);

        if !refresh::is_well_formed(raw_token) {
            return Err(rejected());
        }

        let candidates = self
            .refresh_tokens
            .find_active_candidates(&refresh::lookup_key(raw_token), Utc::now())
            .await?;
        tracing::debug!(candidates = candidates.len(), "Comparing refresh token candidates");

        let matched = candidates
            .into_iter()
            .find(|candidate| {
                self.token_hasher
                    .verify(raw_token, &candidate.token.token_hash)
                    .unwrap_or(false)
            })
            .ok_or_else(rejected)?;

        // hashing is slow enough for the record to expire in between
        let now = Utc::now();
        if !matched.token.is_active_at(now) {
            return Err(rejected());
        }

        if !self.refresh_tokens.consume(matched.token.id, now).await? {
            tracing::warn!(
                user_id = %matched.user.id,
                token_id = %matched.token.id,
                "Refresh token already consumed by a concurrent request"
            );
            return Err(rejected());
        }

        if self.config.security.session_policy == SessionPolicy::Single {
            let revoked = self.refresh_tokens.delete_by_user(matched.user.id).await?;
            tracing::debug!(user_id = %matched.user.id, revoked, "Revoked remaining sessions");
        }

        let user = SessionUser::from(matched.user);
        let pair = self.login(&user).await?;
        tracing::info!(user_id = %user.id, "Refresh token rotated");

        Ok(pair)
    }

    /// 登出：删除用户的所有刷新令牌（幂等）
    pub async fn logout(&self, user_id: Uuid) -> Result<u64, AppError> {
        let revoked = self.refresh_tokens.delete_by_user(user_id).await?;
        tracing::info!(%user_id, revoked, "User logged out");
        Ok(revoked)
    }

    /// 获取个人资料，用户不存在时返回 None
    pub async fn get_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, AppError> {
        let Some(user) = self.users.find_by_id(user_id).await? else {
            return Ok(None);
        };
        let memberships = self.users.find_memberships(user_id).await?;

        Ok(Some(UserProfile::new(user, memberships)))
    }

    /// 更新个人资料
    ///
    /// A password change needs `current_password`; it is verified before
    /// anything is written, so a failed check leaves the name untouched too.
    pub async fn update_me(
        &self,
        user_id: Uuid,
        req: UpdateMeRequest,
    ) -> Result<Option<UserProfile>, AppError> {
        req.validate()?;

        let new_password_hash = match req.new_password.as_deref() {
            Some(new_password) => {
                let current_password = req.current_password.as_deref().ok_or_else(|| {
                    AppError::BadRequest(
                        "currentPassword is required to change the password".to_string(),
                    )
                })?;
                PasswordHasher::validate_password_policy(new_password, &self.config.security)?;

                let stale = || AppError::Unauthorized(AuthFailure::StaleUserOnPasswordChange);
                let user = self.users.find_by_id(user_id).await?.ok_or_else(stale)?;
                if !self
                    .password_hasher
                    .verify(current_password, &user.password_hash)
                    .unwrap_or(false)
                {
                    return Err(stale());
                }

                Some(self.password_hasher.hash(new_password)?)
            }
            None => None,
        };

        if req.name.is_some() || new_password_hash.is_some() {
            let updated = self
                .users
                .update_profile(user_id, req.name.as_deref(), new_password_hash.as_deref())
                .await?;
            if updated.is_none() {
                return Ok(None);
            }
            tracing::info!(
                %user_id,
                name_changed = req.name.is_some(),
                password_changed = new_password_hash.is_some(),
                "Profile updated"
            );
        }

        self.get_profile(user_id).await
    }

    /// 清理过期的刷新令牌
    pub async fn purge_expired_sessions(&self) -> Result<u64, AppError> {
        let purged = self.refresh_tokens.delete_expired(Utc::now()).await?;
        metrics::counter!("auth_sessions_purged_total").increment(purged);
        if purged > 0 {
            tracing::info!(purged, "Expired refresh tokens purged");
        }
        Ok(purged)
    }
}
