//! Password hashing and verification using Argon2id

use crate::{config::HashParams, config::SecurityConfig, error::AppError};
use argon2::{
    password_hash::{
        rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString,
    },
    Algorithm, Argon2, Params, Version,
};

/// Salted one-way hasher, used for passwords and for refresh tokens
#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
}

impl PasswordHasher {
    /// Create hasher with explicit Argon2id parameters
    pub fn new(params: HashParams) -> Result<Self, AppError> {
        let params = Params::new(params.memory_kib, params.iterations, params.parallelism, None)
            .map_err(|e| AppError::Config(format!("Invalid Argon2 params: {}", e)))?;

        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    /// Hash a password
    pub fn hash(&self, password: &str) -> Result<String, AppError> {
        let salt = SaltString::generate(&mut OsRng);

        let password_hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| {
                tracing::error!("Failed to hash password: {:?}", e);
                AppError::Internal(format!("Failed to hash password: {}", e))
            })?
            .to_string();

        Ok(password_hash)
    }

    /// Compare a plaintext against a stored hash.
    ///
    /// `Ok(false)` on mismatch; `Err` only when the stored hash is unparsable.
    /// Parameters embedded in the stored hash win over this hasher's, so rows
    /// written with older parameters keep verifying.
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool, AppError> {
        let parsed_hash = PasswordHash::new(hash).map_err(|e| {
            tracing::warn!("Failed to parse stored hash: {:?}", e);
            AppError::Internal(format!("Failed to parse password hash: {}", e))
        })?;

        Ok(self
            .argon2
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok())
    }

    /// Validate password against policy
    pub fn validate_password_policy(password: &str, policy: &SecurityConfig) -> Result<(), AppError> {
        if password.chars().count() < policy.password_min_length {
            return Err(AppError::BadRequest(format!(
                "Password must be at least {} characters",
                policy.password_min_length
            )));
        }

        if policy.password_require_uppercase && !password.chars().any(|c| c.is_uppercase()) {
            return Err(AppError::BadRequest(
                "Password must contain at least one uppercase letter".to_string(),
            ));
        }

        if policy.password_require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            return Err(AppError::BadRequest(
                "Password must contain at least one digit".to_string(),
            ));
        }

        if policy.password_require_special && password.chars().all(|c| c.is_alphanumeric()) {
            return Err(AppError::BadRequest(
                "Password must contain at least one special character".to_string(),
            ));
        }

        Ok(())
    }
}
