//! 认证相关的 HTTP 处理器

use crate::{
    auth::middleware::AuthContext,
    error::AppError,
    middleware::AppState,
    models::{
        auth::{LoginRequest, MessageResponse, RefreshTokenRequest},
        user::UpdateMeRequest,
    },
};
use axum::{extract::State, response::IntoResponse, Json};
use std::sync::Arc;
use validator::Validate;

/// 登录
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(mut req): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    // 先去掉首尾空白再校验，纯空白邮箱按空值处理
    req.email = req.email.trim().to_string();
    req.validate()?;

    let token_pair = state
        .auth_service
        .authenticate(&req.email, &req.password)
        .await?;

    Ok(Json(token_pair))
}

/// 刷新令牌
pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshTokenRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;

    let token_pair = state.auth_service.refresh_token(&req.refresh_token).await?;

    Ok(Json(token_pair))
}

/// 登出（删除该用户的全部刷新令牌）
pub async fn logout(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    state.auth_service.logout(auth_context.user_id).await?;

    Ok(Json(MessageResponse::new("Logged out successfully")))
}

/// 获取当前用户资料，用户已删除时返回 null
pub async fn get_me(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let profile = state.auth_service.get_profile(auth_context.user_id).await?;

    Ok(Json(profile))
}

/// 更新当前用户的姓名和/或密码
pub async fn update_me(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Json(req): Json<UpdateMeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let profile = state
        .auth_service
        .update_me(auth_context.user_id, req)
        .await?;

    Ok(Json(profile))
}
