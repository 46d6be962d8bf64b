//! HTTP transport to the upstream site.
//!
//! One [`UpstreamClient`] wraps a shared pooled `reqwest::Client` together
//! with the caller's cookies and the retry policy for a single inbound
//! request. Retries cover transport-level timeouts/connection failures and
//! the transient status family {429, 500, 503}; every other 4xx/5xx fails
//! immediately.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{header, Method, StatusCode};
use tokio::time::sleep;
use tracing::warn;
use url::Url;

use super::concurrency::AimdLimiter;
use super::error::{EngineError, EngineResult};

const RETRYABLE_STATUS: [u16; 3] = [429, 500, 503];

/// Response surface the scrapers need: status, final URL after redirects,
/// and the decoded body text.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub final_url: Url,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: Url,
    cookie_header: String,
    timeout: Duration,
    max_retries: u32,
    backoff_factor: f64,
}

impl UpstreamClient {
    pub fn new(
        client: reqwest::Client,
        base_url: Url,
        cookies: &HashMap<String, String>,
        timeout: Duration,
        max_retries: u32,
        backoff_factor: f64,
    ) -> Self {
        let cookie_header = cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            client,
            base_url,
            cookie_header,
            timeout,
            max_retries: max_retries.max(1),
            backoff_factor,
        }
    }

    pub async fn get(
        &self,
        path: &str,
        params: &[(&str, String)],
        limiter: Option<&AimdLimiter>,
    ) -> EngineResult<UpstreamResponse> {
        self.request(Method::GET, path, params, None, limiter).await
    }

    pub async fn post_form(
        &self,
        path: &str,
        form: &[(&str, String)],
        limiter: Option<&AimdLimiter>,
    ) -> EngineResult<UpstreamResponse> {
        self.request(Method::POST, path, &[], Some(form), limiter)
            .await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        form: Option<&[(&str, String)]>,
        limiter: Option<&AimdLimiter>,
    ) -> EngineResult<UpstreamResponse> {
        let url = self.resolve(path)?;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .timeout(self.timeout)
                .header(header::COOKIE, &self.cookie_header);
            if !params.is_empty() {
                request = request.query(params);
            }
            if let Some(form) = form {
                // reqwest sets application/x-www-form-urlencoded here.
                request = request.form(form);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if RETRYABLE_STATUS.contains(&status.as_u16()) {
                        if let Some(limiter) = limiter {
                            limiter.report_failure();
                        }
                        warn!(
                            "upstream {} {} attempt {}/{} returned {}",
                            method,
                            url.path(),
                            attempt,
                            self.max_retries,
                            status
                        );
                        if attempt >= self.max_retries {
                            return Err(EngineError::Network(format!(
                                "upstream kept returning {status} after {attempt} attempts"
                            )));
                        }
                    } else if status.is_client_error() || status.is_server_error() {
                        return Err(EngineError::UpstreamStatus {
                            status: status.as_u16(),
                        });
                    } else {
                        if let Some(limiter) = limiter {
                            limiter.report_success();
                        }
                        let final_url = response.url().clone();
                        let body = response.text().await.map_err(|e| {
                            EngineError::Network(format!("failed to read upstream body: {e}"))
                        })?;
                        return Ok(UpstreamResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                }
                Err(err) if err.is_timeout() || err.is_connect() => {
                    if let Some(limiter) = limiter {
                        limiter.report_failure();
                    }
                    warn!(
                        "upstream {} {} attempt {}/{} failed: {}",
                        method,
                        url.path(),
                        attempt,
                        self.max_retries,
                        err
                    );
                    if attempt >= self.max_retries {
                        return Err(EngineError::Network(format!(
                            "request failed after {attempt} attempts: {err}"
                        )));
                    }
                }
                Err(err) => {
                    return Err(EngineError::Network(err.to_string()));
                }
            }

            let delay = self.backoff_factor * 2f64.powi(attempt as i32 - 1);
            sleep(Duration::from_secs_f64(delay)).await;
        }
    }

    fn resolve(&self, path: &str) -> EngineResult<Url> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path)
                .map_err(|e| EngineError::Internal(format!("invalid upstream url {path:?}: {e}")));
        }
        self.base_url
            .join(path)
            .map_err(|e| EngineError::Internal(format!("invalid upstream path {path:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode as AxumStatus, routing::get, Router};

    use super::*;

    async fn spawn_upstream(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn client_for(addr: SocketAddr, max_retries: u32) -> UpstreamClient {
        UpstreamClient::new(
            reqwest::Client::new(),
            Url::parse(&format!("http://{addr}")).unwrap(),
            &HashMap::from([("sid".to_string(), "abc".to_string())]),
            Duration::from_secs(5),
            max_retries,
            0.01,
        )
    }

    #[tokio::test]
    async fn success_returns_body_and_reports_one_success() {
        let app = Router::new().route("/page", get(|| async { "hello" }));
        let addr = spawn_upstream(app).await;
        let limiter = AimdLimiter::new(5, 1, 50).unwrap();

        let client = client_for(addr, 3);
        let response = client.get("/page", &[], Some(&limiter)).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, "hello");
        // One success is below the growth threshold; the limit is untouched.
        assert_eq!(limiter.limit(), 5);
    }

    #[tokio::test]
    async fn permanent_503_exhausts_exactly_max_retries_attempts() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/page",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::SERVICE_UNAVAILABLE
                }),
            )
            .with_state(hits.clone());
        let addr = spawn_upstream(app).await;
        let limiter = AimdLimiter::new(8, 1, 50).unwrap();

        let client = client_for(addr, 3);
        let err = client.get("/page", &[], Some(&limiter)).await.unwrap_err();
        assert!(matches!(err, EngineError::Network(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        // Three failure reports: 8 -> 4 -> 2 -> 1.
        assert_eq!(limiter.limit(), 1);
    }

    #[tokio::test]
    async fn transient_503_recovers_and_reports_one_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/page",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                        (AxumStatus::SERVICE_UNAVAILABLE, "busy")
                    } else {
                        (AxumStatus::OK, "recovered")
                    }
                }),
            )
            .with_state(hits.clone());
        let addr = spawn_upstream(app).await;
        let limiter = AimdLimiter::new(8, 1, 50).unwrap();

        let client = client_for(addr, 5);
        let response = client.get("/page", &[], Some(&limiter)).await.unwrap();
        assert_eq!(response.body, "recovered");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        // Two failures halved the limit twice; one success starts a streak.
        assert_eq!(limiter.limit(), 2);
    }

    #[tokio::test]
    async fn non_retryable_status_fails_immediately() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/page",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::NOT_FOUND
                }),
            )
            .with_state(hits.clone());
        let addr = spawn_upstream(app).await;

        let client = client_for(addr, 3);
        let err = client.get("/page", &[], None).await.unwrap_err();
        assert!(matches!(err, EngineError::UpstreamStatus { status: 404 }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
