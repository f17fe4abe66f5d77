use std::{
    collections::HashMap,
    sync::Mutex as StdMutex,
    time::{Duration, Instant},
};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use shared::error::ApiError;

/// Errors are cloneable so one network round trip can satisfy every waiter
/// of a deduplicated request.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("server rejected request ({status}): {}", error.message)]
    Api { status: u16, error: ApiError },
}

impl TransportError {
    /// Whether a retry could plausibly succeed. Client-side rejections (4xx)
    /// are permanent; everything else is worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::CircuitOpen | TransportError::Timeout | TransportError::Network(_) => {
                true
            }
            TransportError::Api { status, .. } => *status >= 500,
        }
    }

    /// A refusal issued by the breaker itself must not feed back into its
    /// failure count.
    fn counts_against_breaker(&self) -> bool {
        match self {
            TransportError::CircuitOpen => false,
            TransportError::Timeout | TransportError::Network(_) => true,
            TransportError::Api { status, .. } => *status >= 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Closed / open / half-open circuit breaker shared by every request the
/// transport issues. The transition to half-open grants exactly one trial:
/// the caller that observes the elapsed cooldown takes it, and everyone else
/// keeps being refused until that trial resolves.
pub struct CircuitBreaker {
    inner: StdMutex<BreakerInner>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: StdMutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock").state
    }

    /// Admission check, taken before any request leaves the process.
    pub fn try_acquire(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => Err(TransportError::CircuitOpen),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    debug!("circuit breaker half-open; admitting one trial request");
                    Ok(())
                } else {
                    Err(TransportError::CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.consecutive_failures += 1;
        if inner.state == BreakerState::HalfOpen || inner.consecutive_failures >= self.threshold {
            if inner.state != BreakerState::Open {
                warn!(
                    consecutive_failures = inner.consecutive_failures,
                    "circuit breaker opened"
                );
            }
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(10),
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

type SharedResult = Result<serde_json::Value, TransportError>;

/// HTTP client wrapper carrying the breaker and the in-flight GET table.
/// Concurrent GETs for the same path collapse onto a single network call;
/// mutating verbs always go out individually.
pub struct ResilientTransport {
    http: reqwest::Client,
    base_url: String,
    breaker: CircuitBreaker,
    request_timeout: Duration,
    inflight_gets: Mutex<HashMap<String, broadcast::Sender<SharedResult>>>,
}

impl ResilientTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            breaker: CircuitBreaker::new(config.failure_threshold, config.cooldown),
            request_timeout: config.request_timeout,
            inflight_gets: Mutex::new(HashMap::new()),
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// How long an open breaker refuses traffic before admitting a trial.
    pub fn cooldown(&self) -> Duration {
        self.breaker.cooldown
    }

    /// GET with request deduplication. The first caller for a path performs
    /// the network call; callers arriving while it is in flight subscribe to
    /// its outcome. The table entry is removed before waiters are woken, so
    /// a request arriving after completion starts fresh.
    pub async fn get(&self, path: &str) -> SharedResult {
        let mut rx = {
            let mut inflight = self.inflight_gets.lock().await;
            if let Some(tx) = inflight.get(path) {
                tx.subscribe()
            } else {
                let (tx, _) = broadcast::channel(1);
                inflight.insert(path.to_string(), tx);
                drop(inflight);

                let result = self.execute(reqwest::Method::GET, path, None::<&()>).await;

                let tx = {
                    let mut inflight = self.inflight_gets.lock().await;
                    inflight.remove(path)
                };
                if let Some(tx) = tx {
                    let _ = tx.send(result.clone());
                }
                return result;
            }
        };
        match rx.recv().await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Network(
                "deduplicated request was dropped".into(),
            )),
        }
    }

    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> SharedResult {
        self.execute(reqwest::Method::POST, path, Some(body)).await
    }

    pub async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> SharedResult {
        self.execute(reqwest::Method::PUT, path, Some(body)).await
    }

    pub async fn patch<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> SharedResult {
        self.execute(reqwest::Method::PATCH, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> SharedResult {
        self.execute(reqwest::Method::DELETE, path, None::<&()>)
            .await
    }

    async fn execute<B: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> SharedResult {
        self.breaker.try_acquire()?;
        let result = self.perform(method, path, body).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(err) if err.counts_against_breaker() => self.breaker.record_failure(),
            Err(_) => {}
        }
        result
    }

    async fn perform<B: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> SharedResult {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method, &url)
            .timeout(self.request_timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Network(err.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;

        if !(200..300).contains(&status) {
            let error = serde_json::from_slice::<ApiError>(&bytes).unwrap_or_else(|_| {
                ApiError::internal(format!("http status {status}"))
            });
            return Err(TransportError::Api { status, error });
        }

        if bytes.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|err| TransportError::Network(err.to_string()))
    }
}


#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
