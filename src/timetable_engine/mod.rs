//! Upstream extraction engine.
//!
//! One inbound request runs a fixed pipeline: bootstrap the upstream
//! session from the caller's cookies, prime the teacher map, then fan out
//! over the requested week offsets with bounded concurrency. Each week
//! fetch feeds a second bounded fan-out for per-lesson homework, and the
//! merged result is validated before it is returned.

pub mod client;
pub mod concurrency;
pub mod dates;
pub mod error;
pub mod model;
pub mod parser;
pub mod session;
pub mod teacher_cache;
pub mod validator;

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Utc};
use reqwest::{header, redirect, StatusCode};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

use client::UpstreamClient;
use concurrency::AimdLimiter;
pub use error::{EngineError, EngineResult};
pub use model::{Event, StudentInfo, TimetableData, WeekInfo, FORMAT_VERSION};
use session::Session;
use teacher_cache::{TeacherMap, TeacherMapCache};

/// Base timetable page, fetched once per request for session bootstrap.
const TIMETABLE_PATH: &str = "/132n/";
const TEACHERS_PATH: &str = "/i/teachers.asp";
const WEEK_PATH: &str = "/i/udvalg.asp";
const NOTES_PATH: &str = "/i/note.asp";

/// Constant form fields the upstream expects verbatim.
const FNAME: &str = "Henry";
const NOTES_FUNCTION: &str = "ReadNotesToLessonWithLessonRID";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";
const ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";

const WEEK_LIMIT_MIN: usize = 1;
const WEEK_LIMIT_MAX: usize = 50;
const HOMEWORK_LIMIT_MIN: usize = 1;
const HOMEWORK_LIMIT_MAX: usize = 100;
/// Fixed ceilings used when the caller forces deterministic concurrency.
const FORCED_WEEK_CEILING: usize = 10;
const FORCED_HOMEWORK_CEILING: usize = 30;

/// Process-wide engine configuration, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_url: String,
    pub request_timeout_secs: f64,
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub teacher_cache_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "https://tg.glasir.fo".to_string(),
            request_timeout_secs: 30.0,
            max_retries: 3,
            backoff_factor: 0.5,
            teacher_cache_ttl_secs: 86_400,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: env::var("GLASIR_BASE_URL").unwrap_or(defaults.base_url),
            request_timeout_secs: env_parsed("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            max_retries: env_parsed("MAX_RETRIES", defaults.max_retries),
            backoff_factor: env_parsed("BACKOFF_FACTOR", defaults.backoff_factor),
            teacher_cache_ttl_secs: env_parsed(
                "TEACHER_CACHE_TTL_SECS",
                defaults.teacher_cache_ttl_secs,
            ),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Per-request extraction options. Routes fill this from recognized query
/// parameters; everything has a sane default.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Hold both limiters at fixed ceilings instead of adapting.
    pub force_max_concurrency: bool,
    pub week_fetch_initial: usize,
    pub homework_fetch_initial: usize,
    pub teacher_cache_ttl_sec: u64,
    pub request_timeout_sec: f64,
    pub max_retries: u32,
    pub backoff_factor: f64,
}

struct RequestContext {
    transport: UpstreamClient,
    session: Session,
    teacher_map: TeacherMap,
    week_limiter: AimdLimiter,
    homework_limiter: AimdLimiter,
}

pub struct TimetableEngine {
    config: EngineConfig,
    base_url: Url,
    /// Pooled client for all upstream calls after bootstrap.
    http: reqwest::Client,
    /// Same pool settings but redirects disabled, so a login redirect during
    /// bootstrap is visible as its 3xx status.
    bootstrap_http: reqwest::Client,
    teacher_cache: TeacherMapCache,
}

impl TimetableEngine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            EngineError::Internal(format!("invalid base url {:?}: {e}", config.base_url))
        })?;
        let http = build_http_client(true)
            .map_err(|e| EngineError::Internal(format!("failed to build http client: {e}")))?;
        let bootstrap_http = build_http_client(false)
            .map_err(|e| EngineError::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            config,
            base_url,
            http,
            bootstrap_http,
            teacher_cache: TeacherMapCache::new(),
        })
    }

    /// Per-request defaults derived from the process configuration.
    pub fn default_options(&self) -> ExtractOptions {
        ExtractOptions {
            force_max_concurrency: false,
            week_fetch_initial: 5,
            homework_fetch_initial: 20,
            teacher_cache_ttl_sec: self.config.teacher_cache_ttl_secs,
            request_timeout_sec: self.config.request_timeout_secs,
            max_retries: self.config.max_retries,
            backoff_factor: self.config.backoff_factor,
        }
    }

    /// Fetches one week. `Ok(None)` means the offset produced no parseable
    /// timetable.
    pub async fn fetch_week(
        &self,
        cookie_header: &str,
        student_id: &str,
        offset: i32,
        options: ExtractOptions,
    ) -> EngineResult<Option<TimetableData>> {
        check_student_id(student_id)?;
        let ctx = self.prepare(cookie_header, &options).await?;
        fetch_single_week(ctx, student_id.to_string(), offset).await
    }

    /// Fetches the requested offsets concurrently. Individual offsets that
    /// fail are dropped with a warning; the batch only fails when the
    /// session bootstrap does.
    pub async fn fetch_weeks(
        &self,
        cookie_header: &str,
        student_id: &str,
        offsets: Vec<i32>,
        options: ExtractOptions,
    ) -> EngineResult<Vec<TimetableData>> {
        check_student_id(student_id)?;
        let ctx = self.prepare(cookie_header, &options).await?;
        run_fan_out(ctx, student_id, offsets).await
    }

    /// Discovers every offset in the base week's navigation and fetches
    /// them all; `forward_only` keeps offsets >= 0.
    pub async fn fetch_all_weeks(
        &self,
        cookie_header: &str,
        student_id: &str,
        forward_only: bool,
        options: ExtractOptions,
    ) -> EngineResult<Vec<TimetableData>> {
        check_student_id(student_id)?;
        let ctx = self.prepare(cookie_header, &options).await?;
        let base_body = fetch_week_body(&ctx, student_id, 0).await?;
        let mut offsets = parser::parse_available_offsets(&base_body);
        if forward_only {
            offsets.retain(|&offset| offset >= 0);
        }
        if offsets.is_empty() {
            warn!("no week offsets discovered in base week navigation");
            return Ok(Vec::new());
        }
        debug!("discovered {} week offsets: {offsets:?}", offsets.len());
        run_fan_out(ctx, student_id, offsets).await
    }

    /// The offsets currently reachable from the base week's navigation.
    pub async fn available_offsets(
        &self,
        cookie_header: &str,
        student_id: &str,
        options: ExtractOptions,
    ) -> EngineResult<Vec<i32>> {
        check_student_id(student_id)?;
        let ctx = self.prepare(cookie_header, &options).await?;
        let base_body = fetch_week_body(&ctx, student_id, 0).await?;
        Ok(parser::parse_available_offsets(&base_body))
    }

    /// Bootstraps the session, primes the teacher map, and builds the
    /// limiters for one request.
    async fn prepare(
        &self,
        cookie_header: &str,
        options: &ExtractOptions,
    ) -> EngineResult<Arc<RequestContext>> {
        check_options(options)?;
        let cookies = session::parse_cookie_header(cookie_header);
        if cookies.is_empty() {
            return Err(EngineError::Input(
                "cookie header contained no name=value pairs".to_string(),
            ));
        }

        let timeout = Duration::from_secs_f64(options.request_timeout_sec);
        let bootstrap_transport = UpstreamClient::new(
            self.bootstrap_http.clone(),
            self.base_url.clone(),
            &cookies,
            timeout,
            options.max_retries,
            options.backoff_factor,
        );
        let html = match bootstrap_transport.get(TIMETABLE_PATH, &[], None).await {
            Ok(response) if response.status == StatusCode::OK => response.body,
            Ok(response) => {
                return Err(EngineError::Auth(format!(
                    "upstream answered the bootstrap with status {}",
                    response.status
                )))
            }
            Err(EngineError::UpstreamStatus { status }) if status == 401 || status == 403 => {
                return Err(EngineError::Auth(format!(
                    "upstream rejected the session cookies with status {status}"
                )))
            }
            Err(err) => return Err(err),
        };

        let lname = session::extract_lname(&html).ok_or_else(|| {
            EngineError::UpstreamProtocol("session parameter missing from base page".to_string())
        })?;
        debug!("session bootstrap ok");
        let session = Session { cookies, lname };

        let transport = UpstreamClient::new(
            self.http.clone(),
            self.base_url.clone(),
            &session.cookies,
            timeout,
            options.max_retries,
            options.backoff_factor,
        );

        let (week_limiter, homework_limiter) = if options.force_max_concurrency {
            (
                AimdLimiter::forced(FORCED_WEEK_CEILING),
                AimdLimiter::forced(FORCED_HOMEWORK_CEILING),
            )
        } else {
            (
                AimdLimiter::new(options.week_fetch_initial, WEEK_LIMIT_MIN, WEEK_LIMIT_MAX)?,
                AimdLimiter::new(
                    options.homework_fetch_initial,
                    HOMEWORK_LIMIT_MIN,
                    HOMEWORK_LIMIT_MAX,
                )?,
            )
        };

        let teacher_map = {
            let transport = transport.clone();
            let lname = session.lname.clone();
            self.teacher_cache
                .get_or_fetch(Duration::from_secs(options.teacher_cache_ttl_sec), move || async move {
                    let form = [
                        ("fname", FNAME.to_string()),
                        ("lname", lname),
                        ("timer", session::fresh_timer()),
                    ];
                    let response = transport.post_form(TEACHERS_PATH, &form, None).await?;
                    Ok(parser::parse_teacher_html(&response.body))
                })
                .await
        };

        Ok(Arc::new(RequestContext {
            transport,
            session,
            teacher_map,
            week_limiter,
            homework_limiter,
        }))
    }
}

fn check_student_id(student_id: &str) -> EngineResult<()> {
    if student_id.trim().is_empty() {
        return Err(EngineError::Input("student_id must not be empty".to_string()));
    }
    Ok(())
}

fn check_options(options: &ExtractOptions) -> EngineResult<()> {
    if options.request_timeout_sec <= 0.0 {
        return Err(EngineError::Input("request_timeout_sec must be positive".to_string()));
    }
    if options.max_retries == 0 {
        return Err(EngineError::Input("max_retries must be at least 1".to_string()));
    }
    if options.backoff_factor < 0.0 {
        return Err(EngineError::Input("backoff_factor must not be negative".to_string()));
    }
    Ok(())
}

fn build_http_client(follow_redirects: bool) -> reqwest::Result<reqwest::Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(header::ACCEPT, header::HeaderValue::from_static(ACCEPT));
    let redirect_policy = if follow_redirects {
        redirect::Policy::limited(10)
    } else {
        redirect::Policy::none()
    };
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .redirect(redirect_policy)
        .pool_max_idle_per_host(20)
        .gzip(true)
        .deflate(true)
        .brotli(true)
        .build()
}

async fn run_fan_out(
    ctx: Arc<RequestContext>,
    student_id: &str,
    offsets: Vec<i32>,
) -> EngineResult<Vec<TimetableData>> {
    let mut tasks = JoinSet::new();
    for offset in offsets {
        let ctx = ctx.clone();
        let student_id = student_id.to_string();
        tasks.spawn(async move { (offset, fetch_single_week(ctx, student_id, offset).await) });
    }

    let mut weeks = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(Some(week)))) => weeks.push(week),
            Ok((offset, Ok(None))) => {
                warn!("offset {offset}: no timetable data, dropped from batch");
            }
            Ok((offset, Err(err))) => {
                warn!("offset {offset} dropped from batch: {err}");
            }
            Err(err) => {
                warn!("week task failed: {err}");
            }
        }
    }
    sort_weeks(&mut weeks);
    Ok(weeks)
}

/// Batch order contract: ascending week number, unknown week numbers last.
fn sort_weeks(weeks: &mut [TimetableData]) {
    weeks.sort_by_key(|week| week.week_info.week_number.unwrap_or(u32::MAX));
}

async fn fetch_single_week(
    ctx: Arc<RequestContext>,
    student_id: String,
    offset: i32,
) -> EngineResult<Option<TimetableData>> {
    let body = fetch_week_body(&ctx, &student_id, offset).await?;

    let fallback_year = Utc::now().year();
    let Some(mut parsed) =
        parser::parse_week_html(&body, offset, fallback_year, &ctx.teacher_map)
    else {
        return Ok(None);
    };

    if !parsed.homework_ids.is_empty() {
        let homework = fetch_homework(ctx.clone(), parsed.homework_ids.clone()).await;
        parser::merge_homework(&mut parsed.events, &homework);
    }

    let mut data = TimetableData {
        student_info: parsed.student_info,
        week_info: parsed.week_info,
        events: parsed.events,
        format_version: FORMAT_VERSION,
    };
    validator::validate_timetable(&mut data)?;
    Ok(Some(data))
}

/// POSTs the week form under the week limiter and returns the raw HTML.
async fn fetch_week_body(
    ctx: &RequestContext,
    student_id: &str,
    offset: i32,
) -> EngineResult<String> {
    let _permit = ctx.week_limiter.acquire().await;
    let form = [
        ("fname", FNAME.to_string()),
        ("q", "stude".to_string()),
        ("v", offset.to_string()),
        ("lname", ctx.session.lname.clone()),
        ("timex", session::fresh_timer()),
        ("id", student_id.to_string()),
    ];
    let response = ctx
        .transport
        .post_form(WEEK_PATH, &form, Some(&ctx.week_limiter))
        .await?;
    if response.status.is_redirection() {
        return Err(EngineError::Auth(format!(
            "upstream redirected the week fetch (status {})",
            response.status
        )));
    }
    Ok(response.body)
}

/// Fetches homework for the noted lessons concurrently. Per-lesson failures
/// only cost that lesson its description.
async fn fetch_homework(
    ctx: Arc<RequestContext>,
    lesson_ids: Vec<String>,
) -> HashMap<String, String> {
    let mut tasks = JoinSet::new();
    for lesson_id in lesson_ids {
        let ctx = ctx.clone();
        tasks.spawn(async move {
            let _permit = ctx.homework_limiter.acquire().await;
            let form = [
                ("fname", FNAME.to_string()),
                ("q", lesson_id.clone()),
                ("MyFunktion", NOTES_FUNCTION.to_string()),
                ("lname", ctx.session.lname.clone()),
                ("timer", session::fresh_timer()),
            ];
            match ctx
                .transport
                .post_form(NOTES_PATH, &form, Some(&ctx.homework_limiter))
                .await
            {
                Ok(response) if response.status.is_redirection() => {
                    warn!("homework fetch for lesson {lesson_id} redirected, skipping");
                    None
                }
                Ok(response) => parser::parse_homework_html(&response.body),
                Err(err) => {
                    warn!("homework fetch for lesson {lesson_id} failed: {err}");
                    None
                }
            }
        });
    }

    let mut homework = HashMap::new();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(Some((lesson_id, text))) = joined {
            homework.insert(lesson_id, text);
        }
    }
    homework
}
