//! HTTP 中间件
//! 请求追踪、登录/刷新接口限流

use crate::{
    auth::jwt::JwtService,
    config::{AppConfig, SecurityConfig},
    error::AppError,
    repository::Storage,
    services::AuthService,
};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

/// 应用状态
///
/// 服务都用 Arc 包装，Clone 只是指针拷贝
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub storage: Storage,
    pub auth_service: Arc<AuthService>,
    pub jwt_service: Arc<JwtService>,
    pub rate_limiter: Arc<IpRateLimiter>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, storage: Storage) -> Result<Self, AppError> {
        let config = Arc::new(config);
        let jwt_service = Arc::new(JwtService::from_config(&config)?);
        let auth_service = Arc::new(AuthService::new(&storage, jwt_service.clone(), config.clone())?);
        let rate_limiter = Arc::new(IpRateLimiter::new(RateLimitConfig::from_security(
            &config.security,
        )));

        Ok(Self {
            config,
            storage,
            auth_service,
            jwt_service,
            rate_limiter,
            started_at: Instant::now(),
        })
    }
}

tokio::task_local! {
    /// 当前请求的 request_id，错误响应体复用它
    pub static REQUEST_ID: String;
}

/// 当前请求的 request_id，不在请求上下文中时生成新的
pub fn current_request_id() -> String {
    REQUEST_ID
        .try_with(|id| id.clone())
        .unwrap_or_else(|_| Uuid::new_v4().to_string())
}

/// 请求追踪中间件
/// 为每个请求生成 trace_id 和 request_id，并记录指标
pub async fn request_tracking_middleware(req: Request, next: Next) -> Response {
    let trace_id = extract_or_generate_trace_id(req.headers());
    let request_id = Uuid::new_v4().to_string();

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let span = tracing::info_span!(
        "http_request",
        trace_id = %trace_id,
        request_id = %request_id,
        method = %method,
        path = %path,
    );

    async move {
        let start = Instant::now();

        let mut response = REQUEST_ID.scope(request_id.clone(), next.run(req)).await;

        let elapsed = start.elapsed();
        let status = response.status().as_u16();

        // 指标标签只使用有限取值
        let method_name = match method.as_str() {
            "GET" => "GET",
            "POST" => "POST",
            "PUT" => "PUT",
            "DELETE" => "DELETE",
            "PATCH" => "PATCH",
            _ => "OTHER",
        };
        let status_code = match status {
            200 => "200",
            400 => "400",
            401 => "401",
            404 => "404",
            409 => "409",
            429 => "429",
            500 => "500",
            503 => "503",
            _ => "other",
        };

        metrics::counter!("http_requests_total", "method" => method_name, "status" => status_code)
            .increment(1);
        metrics::histogram!("http_request_duration_seconds").record(elapsed.as_secs_f64());

        tracing::info!(
            status = status,
            elapsed_ms = elapsed.as_millis(),
            "Request completed"
        );

        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            response.headers_mut().insert("x-trace-id", value);
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", value);
        }

        response
    }
    .instrument(span)
    .await
}

/// 从请求头中提取或生成 trace_id
fn extract_or_generate_trace_id(headers: &HeaderMap) -> String {
    headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= 128)
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// 登录/刷新接口限流中间件，以客户端 IP 为键
pub async fn auth_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let client_ip = client_ip(&req, state.config.security.trust_proxy);

    if !state.rate_limiter.check(client_ip) {
        tracing::warn!(
            client_ip = %client_ip,
            path = %req.uri().path(),
            "Rate limit exceeded"
        );
        return Err(AppError::RateLimitExceeded);
    }

    Ok(next.run(req).await)
}

/// 获取客户端 IP 地址
///
/// 信任代理时依次读取 X-Forwarded-For（第一个）和 X-Real-IP，
/// 否则使用连接地址；都拿不到时退回回环地址。
pub fn client_ip(req: &Request, trust_proxy: bool) -> IpAddr {
    let headers = req.headers();

    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<IpAddr>().ok());
        if let Some(ip) = real_ip {
            return ip;
        }
    }

    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip();
    }

    tracing::debug!("Could not determine client IP, using loopback address");
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

// ==================== 限流 ====================

/// 限流配置
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// 时间窗口内的最大请求数
    pub max_requests: usize,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn from_security(security: &SecurityConfig) -> Self {
        Self {
            max_requests: security.login_rate_limit_max as usize,
            window: Duration::from_secs(security.login_rate_limit_window_secs as u64),
        }
    }
}

/// IP 级别的速率限制器（滑动窗口）
pub struct IpRateLimiter {
    /// 每个 IP 在窗口内的请求时间戳
    requests: DashMap<IpAddr, VecDeque<Instant>>,
    config: RateLimitConfig,
}

impl IpRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            requests: DashMap::new(),
            config,
        }
    }

    /// 检查并记录一次请求，超出限制返回 false
    pub fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut requests = self.requests.entry(ip).or_default();

        while let Some(&front) = requests.front() {
            if now.duration_since(front) < self.config.window {
                break;
            }
            requests.pop_front();
        }

        if requests.len() < self.config.max_requests {
            requests.push_back(now);
            true
        } else {
            false
        }
    }

    /// 移除窗口内已无请求的 IP，返回剩余数量
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let window = self.config.window;
        self.requests.retain(|_, requests| {
            requests
                .back()
                .is_some_and(|&last| now.duration_since(last) < window)
        });
        self.requests.len()
    }

    pub fn tracked_ips(&self) -> usize {
        self.requests.len()
    }
}
