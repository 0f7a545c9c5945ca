//! 健康检查处理器
//! 提供 /health 和 /ready 端点

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::{db, middleware::AppState};

/// 存活探针响应
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// 就绪探针响应
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub checks: Vec<HealthCheck>,
}

/// 健康检查项
#[derive(Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// 存活探针
/// 快速响应，不检查依赖
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

/// 数据库检查项
///
/// 失败详情（驱动错误里可能有主机名、用户名）只写日志，不出现在响应里
fn database_check(health: db::HealthStatus) -> HealthCheck {
    let status = match health {
        db::HealthStatus::Healthy => "healthy",
        db::HealthStatus::Unhealthy(detail) => {
            tracing::warn!(detail = %detail, "Readiness: database unhealthy");
            "unhealthy"
        }
    };

    HealthCheck {
        name: "database".to_string(),
        status: status.to_string(),
        message: None,
    }
}

/// 就绪探针
/// 检查存储后端，未就绪时返回 503
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut checks = Vec::new();

    match &state.storage.pool {
        Some(pool) => checks.push(database_check(db::health_check(pool).await)),
        None => checks.push(HealthCheck {
            name: "storage".to_string(),
            status: "healthy".to_string(),
            message: Some("in-memory backend".to_string()),
        }),
    }

    let all_healthy = checks.iter().all(|c| c.status == "healthy");
    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: all_healthy,
            checks,
        }),
    )
}
