//! Inbound JSON API for the timetable extraction engine.
//!
//! Every route requires the opaque upstream cookie string in the `Cookie`
//! header and a `student_id` query parameter; both are forwarded to the
//! engine unchanged. `{username}` is an echo label only.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error};

use crate::timetable_engine::{
    EngineError, ExtractOptions, TimetableData, TimetableEngine,
};

pub fn timetable_routes(engine: Arc<TimetableEngine>) -> Router {
    Router::new()
        .route("/profiles/{username}/weeks/all", get(all_weeks))
        .route(
            "/profiles/{username}/weeks/current_forward",
            get(current_forward_weeks),
        )
        .route("/profiles/{username}/weeks/forward/{count}", get(forward_weeks))
        .route("/profiles/{username}/weeks/{offset}", get(week_by_offset))
        .layer(Extension(engine))
}

/// Recognized query parameters; anything else is rejected with 400.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimetableQuery {
    student_id: String,
    force_max_concurrency: Option<bool>,
    week_fetch_initial: Option<usize>,
    homework_fetch_initial: Option<usize>,
    teacher_cache_ttl_sec: Option<u64>,
    request_timeout_sec: Option<f64>,
    max_retries: Option<u32>,
    backoff_factor: Option<f64>,
}

impl TimetableQuery {
    fn options(&self, engine: &TimetableEngine) -> ExtractOptions {
        let mut options = engine.default_options();
        if let Some(value) = self.force_max_concurrency {
            options.force_max_concurrency = value;
        }
        if let Some(value) = self.week_fetch_initial {
            options.week_fetch_initial = value;
        }
        if let Some(value) = self.homework_fetch_initial {
            options.homework_fetch_initial = value;
        }
        if let Some(value) = self.teacher_cache_ttl_sec {
            options.teacher_cache_ttl_sec = value;
        }
        if let Some(value) = self.request_timeout_sec {
            options.request_timeout_sec = value;
        }
        if let Some(value) = self.max_retries {
            options.max_retries = value;
        }
        if let Some(value) = self.backoff_factor {
            options.backoff_factor = value;
        }
        options
    }
}

async fn week_by_offset(
    Extension(engine): Extension<Arc<TimetableEngine>>,
    Path((username, offset)): Path<(String, i32)>,
    Query(query): Query<TimetableQuery>,
    headers: HeaderMap,
) -> Result<Json<TimetableData>, ApiError> {
    let cookie = require_cookie(&headers)?;
    debug!("single week request for {username}, offset {offset}");
    let data = engine
        .fetch_week(&cookie, &query.student_id, offset, query.options(&engine))
        .await?;
    match data {
        Some(data) => Ok(Json(data)),
        None => Err(ApiError::not_found(format!(
            "no parseable timetable for offset {offset}"
        ))),
    }
}

async fn all_weeks(
    Extension(engine): Extension<Arc<TimetableEngine>>,
    Path(username): Path<String>,
    Query(query): Query<TimetableQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<TimetableData>>, ApiError> {
    let cookie = require_cookie(&headers)?;
    debug!("all weeks request for {username}");
    let weeks = engine
        .fetch_all_weeks(&cookie, &query.student_id, false, query.options(&engine))
        .await?;
    Ok(Json(weeks))
}

async fn current_forward_weeks(
    Extension(engine): Extension<Arc<TimetableEngine>>,
    Path(username): Path<String>,
    Query(query): Query<TimetableQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<TimetableData>>, ApiError> {
    let cookie = require_cookie(&headers)?;
    debug!("current/forward weeks request for {username}");
    let weeks = engine
        .fetch_all_weeks(&cookie, &query.student_id, true, query.options(&engine))
        .await?;
    Ok(Json(weeks))
}

async fn forward_weeks(
    Extension(engine): Extension<Arc<TimetableEngine>>,
    Path((username, count)): Path<(String, i32)>,
    Query(query): Query<TimetableQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<TimetableData>>, ApiError> {
    let cookie = require_cookie(&headers)?;
    if count < 0 {
        return Err(ApiError::bad_request("count must not be negative"));
    }
    debug!("forward weeks request for {username}, count {count}");
    let offsets: Vec<i32> = (0..=count).collect();
    let weeks = engine
        .fetch_weeks(&cookie, &query.student_id, offsets, query.options(&engine))
        .await?;
    Ok(Json(weeks))
}

fn require_cookie(headers: &HeaderMap) -> Result<String, ApiError> {
    let value = headers
        .get(header::COOKIE)
        .ok_or_else(|| ApiError::bad_request("Cookie header is required"))?;
    let value = value
        .to_str()
        .map_err(|_| ApiError::bad_request("Cookie header is not valid UTF-8"))?;
    Ok(value.to_string())
}

/// JSON error envelope: `{"error": <category>, "message": <text>}`.
struct ApiError {
    status: StatusCode,
    category: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            category: "bad_request",
            message: message.into(),
        }
    }

    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            category: "not_found",
            message,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::Input(_) => StatusCode::BAD_REQUEST,
            EngineError::Auth(_) => StatusCode::UNAUTHORIZED,
            EngineError::UpstreamProtocol(_)
            | EngineError::UpstreamStatus { .. }
            | EngineError::Validation(_) => StatusCode::BAD_GATEWAY,
            EngineError::Network(_) => StatusCode::GATEWAY_TIMEOUT,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("internal error served as 500: {err}");
        }
        Self {
            status,
            category: err.category(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"error": self.category, "message": self.message})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::routing::post;

    use super::*;
    use crate::timetable_engine::EngineConfig;

    async fn spawn(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// Adapter wired to an unreachable upstream; good enough for routes
    /// that must fail before any upstream call.
    async fn spawn_adapter_without_upstream() -> SocketAddr {
        let engine = Arc::new(
            TimetableEngine::new(EngineConfig {
                base_url: "http://127.0.0.1:1".to_string(),
                request_timeout_secs: 1.0,
                max_retries: 1,
                backoff_factor: 0.01,
                teacher_cache_ttl_secs: 60,
            })
            .unwrap(),
        );
        spawn(timetable_routes(engine)).await
    }

    #[tokio::test]
    async fn negative_count_is_rejected_without_an_upstream_call() {
        let addr = spawn_adapter_without_upstream().await;
        let response = reqwest::Client::new()
            .get(format!("http://{addr}/profiles/x/weeks/forward/-3?student_id=1"))
            .header(header::COOKIE, "sid=abc")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn missing_cookie_header_is_a_bad_request() {
        let addr = spawn_adapter_without_upstream().await;
        let response = reqwest::Client::new()
            .get(format!("http://{addr}/profiles/x/weeks/0?student_id=1"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn missing_student_id_is_a_bad_request() {
        let addr = spawn_adapter_without_upstream().await;
        let response = reqwest::Client::new()
            .get(format!("http://{addr}/profiles/x/weeks/0"))
            .header(header::COOKIE, "sid=abc")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn unknown_query_options_are_rejected() {
        let addr = spawn_adapter_without_upstream().await;
        let response = reqwest::Client::new()
            .get(format!(
                "http://{addr}/profiles/x/weeks/0?student_id=1&turbo_mode=yes"
            ))
            .header(header::COOKIE, "sid=abc")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn unreachable_upstream_surfaces_as_gateway_timeout() {
        let addr = spawn_adapter_without_upstream().await;
        let response = reqwest::Client::new()
            .get(format!("http://{addr}/profiles/x/weeks/0?student_id=1"))
            .header(header::COOKIE, "sid=abc")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 504);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "network_error");
    }

    const BASE_PAGE: &str =
        r#"<html><body><input type="hidden" name="lname" value="Ford1"></body></html>"#;
    const WEEK_PAGE: &str = r##"<html><body>
<a class="UgeKnapValgt" onclick="skemaVis('stude',v=0)">Vika 13</a>
<td>24.03.2025 - 30.03.2025</td>
<table class="time_8_16">
  <tr>
    <td class="lektionslinje_1_aktuel">Mánadagur 24/3</td>
    <td colspan="24" class="lektionslinje_lesson0">
      <a href="#">søg-A-123-2425-x</a><a href="#">BIJ</a><a href="#">608</a>
      <span id="MyWindow12345Main"></span>
    </td>
  </tr>
</table>
</body></html>"##;

    async fn spawn_full_stack() -> SocketAddr {
        let upstream = Router::new()
            .route("/132n/", get(|| async { axum::response::Html(BASE_PAGE) }))
            .route(
                "/i/teachers.asp",
                post(|| async { axum::response::Html("<html><body></body></html>") }),
            )
            .route("/i/udvalg.asp", post(|| async { axum::response::Html(WEEK_PAGE) }));
        let upstream_addr = spawn(upstream).await;

        let engine = Arc::new(
            TimetableEngine::new(EngineConfig {
                base_url: format!("http://{upstream_addr}"),
                request_timeout_secs: 5.0,
                max_retries: 2,
                backoff_factor: 0.01,
                teacher_cache_ttl_secs: 60,
            })
            .unwrap(),
        );
        spawn(timetable_routes(engine)).await
    }

    #[tokio::test]
    async fn single_week_round_trip_serves_camel_case_json() {
        let addr = spawn_full_stack().await;
        let response = reqwest::Client::new()
            .get(format!("http://{addr}/profiles/alice/weeks/0?student_id=guid-1"))
            .header(header::COOKIE, "sid=abc")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["formatVersion"], 2);
        assert_eq!(body["weekInfo"]["weekNumber"], 13);
        assert_eq!(body["weekInfo"]["weekKey"], "2025-W13");
        assert_eq!(body["events"][0]["title"], "søg");
        assert_eq!(body["events"][0]["dayOfWeek"], "Monday");
        // Teacher map is empty upstream: initials fall back to themselves.
        assert_eq!(body["events"][0]["teacher"], "BIJ");
        assert_eq!(body["events"][0]["hasHomeworkNote"], false);
        assert!(body["events"][0].get("description").is_none());
    }

    #[tokio::test]
    async fn forward_zero_returns_a_single_element_batch() {
        let addr = spawn_full_stack().await;
        let response = reqwest::Client::new()
            .get(format!(
                "http://{addr}/profiles/alice/weeks/forward/0?student_id=guid-1"
            ))
            .header(header::COOKIE, "sid=abc")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body.as_array().unwrap().len(), 1);
    }
}
