use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ChallengeConfig, FetchConfig};
use crate::error::{FetchError, FetchFailure};

/// Markers found in Cloudflare interstitial pages.
const CHALLENGE_MARKERS: &[&str] = &["cf-chl", "Just a moment", "challenge-platform"];

/// Extra time granted to the solver HTTP call on top of its own `maxTimeout`.
const SOLVER_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// Plain HTTP retrieval.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<RawResponse, FetchError>;
}

/// Backend that completes anti-bot verification and returns the final page.
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    async fn solve(&self, url: &str, timeout: Duration) -> Result<RawResponse, FetchError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Direct first, challenge solver after the first direct failure.
    #[default]
    Auto,
    Direct,
    /// Target is known to sit behind a challenge; never try direct.
    Challenge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    Direct,
    Solver,
}

impl Via {
    pub fn as_str(self) -> &'static str {
        match self {
            Via::Direct => "direct",
            Via::Solver => "solver",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
    pub mode: FetchMode,
    pub solve_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub body: String,
    pub attempts: u32,
    pub via: Via,
}

pub struct Fetcher {
    transport: Box<dyn Transport>,
    solver: Option<Box<dyn ChallengeSolver>>,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(transport: Box<dyn Transport>, solver: Option<Box<dyn ChallengeSolver>>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            solver,
            policy,
        }
    }

    /// Build the production fetcher: reqwest transport plus FlareSolverr when configured.
    pub fn from_config(fetch: &FetchConfig, challenge: &ChallengeConfig) -> Result<Self> {
        let timeout = fetch.timeout()?;
        let transport = HttpTransport::new(&fetch.user_agent, timeout).context("building HTTP transport")?;

        let solver: Option<Box<dyn ChallengeSolver>> = match &challenge.url {
            Some(endpoint) => Some(Box::new(
                FlareSolverr::new(endpoint).context("building challenge solver client")?,
            )),
            None => None,
        };

        let policy = RetryPolicy {
            retries: fetch.retries,
            delay: fetch.retry_delay()?,
            mode: fetch.mode,
            solve_timeout: challenge.max_timeout()?,
        };

        info!(
            retries = policy.retries,
            mode = ?policy.mode,
            solver = solver.is_some(),
            "fetcher ready"
        );

        Ok(Self::new(Box::new(transport), solver, policy))
    }

    /// Fetch `url`, treating bodies shorter than `min_size` bytes as failed attempts.
    pub async fn fetch(&self, url: &str, min_size: usize) -> Result<Fetched, FetchFailure> {
        let retries = self.policy.retries.max(1);
        let mut use_solver = self.policy.mode == FetchMode::Challenge;
        let mut last_error = None;

        for attempt in 1..=retries {
            if attempt > 1 && !self.policy.delay.is_zero() {
                tokio::time::sleep(self.policy.delay).await;
            }

            let via = if use_solver { Via::Solver } else { Via::Direct };
            debug!(url = %url, attempt, retries, via = via.as_str(), "fetch attempt");

            let result = match via {
                Via::Direct => self.transport.get(url).await,
                Via::Solver => match &self.solver {
                    Some(solver) => solver.solve(url, self.policy.solve_timeout).await,
                    None => Err(FetchError::Solver {
                        url: url.to_string(),
                        message: "no challenge solver configured".to_string(),
                    }),
                },
            };

            let checked = result.and_then(|response| {
                debug!(url = %url, status = response.status, bytes = response.body.len(), "response received");
                check_size(url, response, min_size)
            });

            match checked {
                Ok(body) => {
                    info!(url = %url, attempt, bytes = body.len(), via = via.as_str(), "fetched");
                    return Ok(Fetched {
                        body,
                        attempts: attempt,
                        via,
                    });
                }
                Err(e) => {
                    warn!(url = %url, attempt, retries, kind = e.kind(), error = %e, "fetch attempt failed");
                    if via == Via::Direct && self.policy.mode == FetchMode::Auto && self.solver.is_some() {
                        info!(url = %url, "switching to challenge solver");
                        use_solver = true;
                    }
                    last_error = Some(e);
                }
            }
        }

        let last_error = last_error.unwrap_or_else(|| FetchError::Solver {
            url: url.to_string(),
            message: "no attempt was made".to_string(),
        });
        Err(FetchFailure {
            url: url.to_string(),
            attempts: retries,
            last_error,
        })
    }
}

fn check_size(url: &str, response: RawResponse, min_size: usize) -> Result<String, FetchError> {
    if response.body.len() < min_size {
        return Err(FetchError::ContentTooShort {
            url: url.to_string(),
            len: response.body.len(),
            min: min_size,
        });
    }
    Ok(response.body)
}

fn looks_like_challenge(status: u16, body: &str) -> bool {
    matches!(status, 403 | 503) && CHALLENGE_MARKERS.iter().any(|marker| body.contains(marker))
}

/// Status checks shared by both backends: challenge pages and non-2xx replies fail the attempt.
fn check_upstream(url: &str, status: u16, body: String) -> Result<RawResponse, FetchError> {
    if looks_like_challenge(status, &body) {
        return Err(FetchError::Challenge {
            url: url.to_string(),
            message: format!("HTTP {status} interstitial"),
        });
    }
    if !(200..300).contains(&status) {
        return Err(FetchError::Status {
            url: url.to_string(),
            status,
        });
    }
    Ok(RawResponse { status, body })
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/json;q=0.9,*/*;q=0.8"),
        );

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<RawResponse, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| FetchError::Http {
            url: url.to_string(),
            source: e,
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| FetchError::Http {
            url: url.to_string(),
            source: e,
        })?;

        check_upstream(url, status, body)
    }
}

/// Client for a FlareSolverr `/v1` endpoint.
pub struct FlareSolverr {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SolveRequest<'a> {
    cmd: &'static str,
    url: &'a str,
    max_timeout: u64,
}

#[derive(Deserialize)]
struct SolveResponse {
    status: String,
    #[serde(default)]
    message: String,
    solution: Option<Solution>,
}

#[derive(Deserialize)]
struct Solution {
    status: Option<u16>,
    response: Option<String>,
}

impl FlareSolverr {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl ChallengeSolver for FlareSolverr {
    async fn solve(&self, url: &str, timeout: Duration) -> Result<RawResponse, FetchError> {
        let request = SolveRequest {
            cmd: "request.get",
            url,
            max_timeout: timeout.as_millis() as u64,
        };

        debug!(endpoint = %self.endpoint, url = %url, "requesting challenge solution");

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(timeout + SOLVER_MARGIN)
            .json(&request)
            .send()
            .await
            .map_err(|e| FetchError::Http {
                url: self.endpoint.clone(),
                source: e,
            })?;

        if !response.status().is_success() {
            return Err(FetchError::Solver {
                url: url.to_string(),
                message: format!("solver answered HTTP {}", response.status().as_u16()),
            });
        }

        let parsed: SolveResponse = response.json().await.map_err(|e| FetchError::Http {
            url: self.endpoint.clone(),
            source: e,
        })?;

        solution_to_response(url, parsed)
    }
}

fn solution_to_response(url: &str, parsed: SolveResponse) -> Result<RawResponse, FetchError> {
    if parsed.status != "ok" {
        let message = if parsed.message.is_empty() {
            format!("solver status '{}'", parsed.status)
        } else {
            parsed.message
        };
        return Err(FetchError::Challenge {
            url: url.to_string(),
            message,
        });
    }

    let solution = parsed.solution.ok_or_else(|| FetchError::Solver {
        url: url.to_string(),
        message: "solver reply has no solution".to_string(),
    })?;

    check_upstream(
        url,
        solution.status.unwrap_or(200),
        solution.response.unwrap_or_default(),
    )
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::testing::{FixedSolver, ScriptedTransport, policy};
    use super::*;

    const URL: &str = "https://schedule.example/";

    fn ok(body: &str) -> Result<RawResponse, FetchError> {
        Ok(RawResponse {
            status: 200,
            body: body.to_string(),
        })
    }

    #[tokio::test]
    async fn short_bodies_are_retried_until_valid() {
        let transport = ScriptedTransport::default()
            .push(URL, ok("tiny"))
            .push(URL, ok("<html></html>"))
            .push(URL, ok(&"x".repeat(64)));
        let calls = transport.calls.clone();
        let fetcher = Fetcher::new(Box::new(transport), None, policy(3, FetchMode::Direct));

        let fetched = fetcher.fetch(URL, 32).await.unwrap();
        assert_eq!(fetched.attempts, 3);
        assert_eq!(fetched.via, Via::Direct);
        assert_eq!(fetched.body.len(), 64);
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_keep_last_error() {
        let transport = ScriptedTransport::default()
            .push(
                URL,
                Err(FetchError::Status {
                    url: URL.to_string(),
                    status: 500,
                }),
            )
            .push(URL, ok("short"));
        let fetcher = Fetcher::new(Box::new(transport), None, policy(2, FetchMode::Direct));

        let failure = fetcher.fetch(URL, 100).await.unwrap_err();
        assert_eq!(failure.attempts, 2);
        assert!(matches!(
            failure.last_error,
            FetchError::ContentTooShort { len: 5, min: 100, .. }
        ));
    }

    #[tokio::test]
    async fn auto_mode_falls_back_to_solver() {
        let transport = ScriptedTransport::default().push(
            URL,
            Err(FetchError::Challenge {
                url: URL.to_string(),
                message: "HTTP 403 interstitial".to_string(),
            }),
        );
        let direct_calls = transport.calls.clone();
        let solver_calls = Arc::new(AtomicU32::new(0));
        let solver = FixedSolver {
            body: "<div id=\"schedule\"></div>".repeat(10),
            calls: solver_calls.clone(),
        };
        let fetcher = Fetcher::new(Box::new(transport), Some(Box::new(solver)), policy(3, FetchMode::Auto));

        let fetched = fetcher.fetch(URL, 10).await.unwrap();
        assert_eq!(fetched.attempts, 2);
        assert_eq!(fetched.via, Via::Solver);
        assert_eq!(direct_calls.lock().unwrap().len(), 1);
        assert_eq!(solver_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn challenge_mode_never_goes_direct() {
        let transport = ScriptedTransport::default().push(URL, ok(&"y".repeat(50)));
        let direct_calls = transport.calls.clone();
        let solver = FixedSolver {
            body: "z".repeat(50),
            calls: Arc::new(AtomicU32::new(0)),
        };
        let fetcher = Fetcher::new(
            Box::new(transport),
            Some(Box::new(solver)),
            policy(3, FetchMode::Challenge),
        );

        let fetched = fetcher.fetch(URL, 10).await.unwrap();
        assert_eq!(fetched.attempts, 1);
        assert_eq!(fetched.body, "z".repeat(50));
        assert!(direct_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_mode_without_solver_keeps_direct() {
        let transport = ScriptedTransport::default()
            .push(URL, ok(""))
            .push(URL, ok(&"a".repeat(20)));
        let fetcher = Fetcher::new(Box::new(transport), None, policy(3, FetchMode::Auto));

        let fetched = fetcher.fetch(URL, 10).await.unwrap();
        assert_eq!(fetched.attempts, 2);
        assert_eq!(fetched.via, Via::Direct);
    }

    #[test]
    fn challenge_detection() {
        assert!(looks_like_challenge(403, "<title>Just a moment...</title>"));
        assert!(looks_like_challenge(503, "<script src=\"/cdn-cgi/challenge-platform/h/b\">"));
        assert!(!looks_like_challenge(200, "Just a moment"));
        assert!(!looks_like_challenge(403, "Forbidden"));
    }

    #[test]
    fn solver_reply_parsing() {
        let ok: SolveResponse = serde_json::from_str(
            r#"{"status":"ok","message":"Challenge solved!","solution":{"status":200,"response":"<html>hi</html>"}}"#,
        )
        .unwrap();
        let response = solution_to_response(URL, ok).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "<html>hi</html>");

        let failed: SolveResponse =
            serde_json::from_str(r#"{"status":"error","message":"Error: timeout reached"}"#).unwrap();
        let err = solution_to_response(URL, failed).unwrap_err();
        assert!(matches!(err, FetchError::Challenge { ref message, .. } if message.contains("timeout")));

        let upstream_error: SolveResponse = serde_json::from_str(
            r#"{"status":"ok","message":"","solution":{"status":503,"response":"<html>Service Unavailable</html>"}}"#,
        )
        .unwrap();
        let err = solution_to_response(URL, upstream_error).unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 503, .. }));

        let still_challenged: SolveResponse = serde_json::from_str(
            r#"{"status":"ok","message":"","solution":{"status":403,"response":"<title>Just a moment...</title>"}}"#,
        )
        .unwrap();
        let err = solution_to_response(URL, still_challenged).unwrap_err();
        assert!(matches!(err, FetchError::Challenge { .. }));
    }

    #[test]
    fn solve_request_uses_flaresolverr_field_names() {
        let request = SolveRequest {
            cmd: "request.get",
            url: URL,
            max_timeout: 60000,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["cmd"], "request.get");
        assert_eq!(json["maxTimeout"], 60000);
    }
}
