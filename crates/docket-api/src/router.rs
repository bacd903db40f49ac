//! Route table and middleware stack.

use axum::{
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::Response,
    routing::{get, patch, post, put},
    Router,
};
use governor::clock::{Clock as _, DefaultClock};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::error::too_many_requests;
use crate::handlers::{admin, alerts, audit, health, jobs, sessions};
use crate::identity::{ACTOR_HEADER, ROLE_HEADER, TENANT_HEADER};
use crate::state::AppState;

/// Request bodies are small JSON documents; document bytes go to storage.
const BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000";

/// Time-ordered UUIDv7 request correlation ids.
#[derive(Clone, Default)]
pub struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = Uuid::now_v7().to_string().parse().ok()?;
        Some(RequestId::new(id))
    }
}

/// `ALLOWED_ORIGINS`, comma separated.
fn allowed_origins() -> Vec<HeaderValue> {
    let raw = std::env::var("ALLOWED_ORIGINS")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.to_string());
    raw.split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(origin = trimmed, error = %e, "Invalid CORS origin");
                    None
                }
            }
        })
        .collect()
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins()))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(TENANT_HEADER),
            HeaderName::from_static(ACTOR_HEADER),
            HeaderName::from_static(ROLE_HEADER),
        ])
        .max_age(std::time::Duration::from_secs(3600))
}

/// Coarse process-wide limiter in front of the per-actor one.
async fn global_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(limiter) = &state.global_limiter {
        if let Err(not_until) = limiter.check() {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            let retry_after = (wait.as_secs() + u64::from(wait.subsec_nanos() > 0)).max(1);
            tracing::warn!(subsystem = "api", retry_after, "Global rate limit exceeded");
            return too_many_requests("Too many requests. Please wait before retrying.", retry_after);
        }
    }
    next.run(request).await
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        // Jobs
        .route("/api/v1/jobs", post(jobs::submit_job).get(jobs::list_jobs))
        .route("/api/v1/jobs/stats", get(jobs::queue_stats))
        .route("/api/v1/jobs/:id", get(jobs::get_job))
        .route("/api/v1/jobs/:id/cancel", post(jobs::cancel_job))
        // Audit
        .route(
            "/api/v1/audit/events",
            get(audit::query_events).post(audit::record_event),
        )
        // Alerts
        .route(
            "/api/v1/alerts",
            get(alerts::list_alerts).post(alerts::raise_alert),
        )
        .route("/api/v1/alerts/stream", get(alerts::alert_stream))
        .route("/api/v1/alerts/:id", patch(alerts::update_alert))
        // Sessions
        .route("/api/v1/sessions", post(sessions::create_session))
        .route("/api/v1/sessions/:id/touch", post(sessions::touch_session))
        // Administration
        .route("/api/v1/admin/tenants/:id", put(admin::upsert_tenant))
        .route("/api/v1/admin/rate-limits", put(admin::replace_rate_limits))
        .route("/api/v1/admin/retention", put(admin::replace_retention))
        .route("/api/v1/admin/config", get(admin::current_config))
        // Middleware
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            global_rate_limit,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7))
        .layer(cors_layer())
        .layer(CatchPanicLayer::new())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
        .with_state(state)
}
