//! The request pipeline.
//!
//! [`Pipeline::request`] turns "call this endpoint with these params" into an
//! authenticated, rate-limited, retried and normalized HTTP exchange:
//!
//! 1. circuit breaker check, failing fast while the exchange is blown
//! 2. wait for rate-limit capacity on `{exchange, api key or public}`
//! 3. resolve the base URL (override, or the exchange table, sandbox-aware)
//! 4. sign with the exchange's pattern, or build an unsigned JSON request
//! 5. send with the configured timeout and retry policy
//! 6. record quota headers, then normalize the response
//! 7. on transport failure, report `NetworkError` and feed the breaker
//!
//! # Example
//!
//! ```rust,no_run
//! use exchange_pipeline::{Credentials, Exchange, Pipeline, RequestOptions};
//! use exchange_pipeline::signing::CustomSigners;
//! use reqwest::Method;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let exchange = Exchange::from_json(r#"{
//!         "id": "binance",
//!         "urls": { "api": { "rest": "https://api.binance.com" } },
//!         "signing": { "pattern": "hmac_sha256_query" },
//!         "rate_limits": { "requests": 1200, "period": 60000 }
//!     }"#, &CustomSigners::new())?;
//!
//!     let pipeline = Pipeline::new();
//!
//!     let time = pipeline
//!         .request(&exchange, Method::GET, "/api/v3/time", RequestOptions::new())
//!         .await?;
//!     println!("{:?}", time.json());
//!
//!     let account = pipeline
//!         .request(
//!             &exchange,
//!             Method::GET,
//!             "/api/v3/account",
//!             RequestOptions::new().credentials(Credentials::new("key", "secret")),
//!         )
//!         .await?;
//!     println!("{:?}", account.json());
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Method, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{
    RetryTransientMiddleware, Retryable, RetryableStrategy, default_on_request_failure,
    default_on_request_success, policies::ExponentialBackoff,
};
use reqwest_tracing::TracingMiddleware;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::auth::Credentials;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, TransportOutcome};
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ErrorKind, NormalizedError};
use crate::exchange::Exchange;
use crate::rate_limit::{self, LimitConfig, RateLimitInfo, RateLimitKey, RateLimitStore, RateLimiter};
use crate::response::{ErrorNormalizer, Response};
use crate::signing::encode::{RequestParts, join_url};
use crate::signing::{Request, SignContext, SignOutcome, SignedRequest};
use crate::telemetry::{RequestEvent, Telemetry, TracingTelemetry};

/// Default transport timeout when neither the call nor the exchange sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Whether transient failures (connect errors, 5xx) are retried by the
/// transport. A 429 is never retried there; it surfaces as `RateLimited`.
///
/// Unless set explicitly, unsigned requests use `Transient` and signed
/// requests use `Disabled`: a retry would resend the same timestamp and nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Exponential backoff, up to the pipeline's `max_retries`.
    Transient,
    /// Exactly one attempt.
    Disabled,
}

/// The default transient strategy, minus 429.
struct SkipTooManyRequests;

impl RetryableStrategy for SkipTooManyRequests {
    fn handle(&self, res: &Result<reqwest::Response, reqwest_middleware::Error>) -> Option<Retryable> {
        match res {
            Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => Some(Retryable::Fatal),
            Ok(response) => default_on_request_success(response),
            Err(error) => default_on_request_failure(error),
        }
    }
}

/// Per-call options for [`Pipeline::request`].
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub params: BTreeMap<String, Value>,
    /// Explicit body; replaces params as the body of non-GET requests
    pub body: Option<Value>,
    /// Sign the request with these credentials
    pub credentials: Option<Credentials>,
    pub timeout: Option<Duration>,
    /// `None` picks by whether the request is signed
    pub retry: Option<RetryMode>,
    /// Rate-limit weight of this call
    pub cost: u64,
    /// Replaces the exchange's `rate_limits`
    pub rate_limit: Option<LimitConfig>,
    /// Replaces the URL table lookup
    pub base_url: Option<String>,
    /// Which URL table entry to use
    pub url_key: Option<String>,
    /// Use sandbox URLs even without sandbox credentials
    pub sandbox: bool,
    /// Log request and transport failure details
    pub debug_request: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            params: BTreeMap::new(),
            body: None,
            credentials: None,
            timeout: None,
            retry: None,
            cost: 1,
            rate_limit: None,
            base_url: None,
            url_key: None,
            sandbox: false,
            debug_request: false,
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn params(mut self, params: BTreeMap<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryMode) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    pub fn rate_limit(mut self, limit: LimitConfig) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn url_key(mut self, key: impl Into<String>) -> Self {
        self.url_key = Some(key.into());
        self
    }

    pub fn sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn debug_request(mut self, debug: bool) -> Self {
        self.debug_request = debug;
        self
    }

    fn use_sandbox(&self) -> bool {
        self.sandbox || self.credentials.as_ref().is_some_and(|c| c.sandbox)
    }

    /// The retry mode this call runs with.
    pub fn effective_retry(&self) -> RetryMode {
        match (self.retry, &self.credentials) {
            (Some(mode), _) => mode,
            (None, Some(_)) => RetryMode::Disabled,
            (None, None) => RetryMode::Transient,
        }
    }
}

/// Shared request pipeline.
///
/// Cheap to clone; clones share the HTTP connection pool, the rate limiter,
/// the circuit breaker and the rate-limit store.
#[derive(Clone)]
pub struct Pipeline {
    http: ClientWithMiddleware,
    http_no_retry: ClientWithMiddleware,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    store: Arc<RateLimitStore>,
    telemetry: Arc<dyn Telemetry>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl Pipeline {
    /// A pipeline with default settings and fresh state.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn rate_limit_store(&self) -> &Arc<RateLimitStore> {
        &self.store
    }

    /// Prune rate-limit buckets older than `max_age`, then evict idle buckets
    /// and quota snapshots past the limiter's idle horizon. Returns the number
    /// of buckets and snapshots evicted.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        self.limiter.cleanup(max_age) + self.store.cleanup(self.limiter.idle_eviction())
    }

    /// Run [`Pipeline::cleanup`] every `interval` until the limiter and the
    /// store are dropped.
    pub fn spawn_maintenance(&self, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let limiter: Weak<RateLimiter> = Arc::downgrade(&self.limiter);
        let store: Weak<RateLimitStore> = Arc::downgrade(&self.store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (Some(limiter), Some(store)) = (limiter.upgrade(), store.upgrade()) else {
                    break;
                };
                limiter.cleanup(max_age);
                store.cleanup(limiter.idle_eviction());
            }
        })
    }

    /// Latest quota snapshot seen for this exchange and credentials.
    pub fn rate_limit_info(
        &self,
        exchange: &Exchange,
        credentials: Option<&Credentials>,
    ) -> Option<Arc<RateLimitInfo>> {
        self.store
            .get(&RateLimitKey::for_credentials(exchange.id(), credentials))
    }

    /// Run one request through the pipeline.
    pub async fn request(
        &self,
        exchange: &Exchange,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<Response, NormalizedError> {
        let started = Instant::now();
        let mut event = RequestEvent::new(exchange.id(), method.clone(), path);
        self.telemetry.on_start(&event);

        let result = self.execute(exchange, method, path, &options, &mut event).await;

        event.duration = started.elapsed();
        match (&result, event.status) {
            (Ok(_), _) => self.telemetry.on_stop(&event, None),
            (Err(error), Some(_)) => self.telemetry.on_stop(&event, Some(error)),
            (Err(error), None) => self.telemetry.on_exception(&event, error),
        }
        result
    }

    async fn execute(
        &self,
        exchange: &Exchange,
        method: Method,
        path: &str,
        options: &RequestOptions,
        event: &mut RequestEvent,
    ) -> Result<Response, NormalizedError> {
        let id = exchange.id();

        self.breaker
            .check(id)
            .map_err(|open| NormalizedError::circuit_open(id, open.retry_in_ms))?;

        let key = RateLimitKey::for_credentials(id, options.credentials.as_ref());
        let limit = options.rate_limit.as_ref().or(exchange.rate_limit());
        let waited = self
            .limiter
            .wait(&key, limit, options.cost)
            .await
            .map_err(|e| NormalizedError::new(id, ErrorKind::InvalidParameters, e.to_string()))?;
        if !waited.is_zero() {
            tracing::debug!(%key, waited_ms = waited.as_millis() as u64, "rate limit delay");
        }

        let base_url = match &options.base_url {
            Some(url) => url.clone(),
            None => exchange
                .base_url(options.url_key.as_deref(), options.use_sandbox())
                .map_err(|e| NormalizedError::new(id, ErrorKind::NotSupported, e.to_string()))?
                .to_string(),
        };

        let mut logical = Request::new(method, path).params(options.params.clone());
        logical.body = options.body.clone();

        let prepared = match &options.credentials {
            Some(credentials) => self.sign(exchange, &logical, credentials, base_url)?,
            None => unsigned(exchange, &logical, &base_url)?,
        };

        if options.debug_request {
            let header_names: Vec<&str> = prepared.headers.iter().map(|(n, _)| n.as_str()).collect();
            tracing::debug!(
                exchange = id,
                method = %prepared.method,
                url = %prepared.url,
                headers = ?header_names,
                "sending request"
            );
        }

        let timeout = options
            .timeout
            .or(exchange.timeout())
            .unwrap_or(self.timeout);
        let header_map = header_map(id, &prepared.headers)?;
        let (status, headers, body) = match self
            .send(id, prepared, header_map, options.effective_retry(), timeout)
            .await
        {
            Ok(parts) => {
                self.breaker.record_result(id, TransportOutcome::Completed);
                parts
            }
            Err(failure) => {
                self.breaker.record_result(id, TransportOutcome::Failed);
                if options.debug_request {
                    tracing::warn!(exchange = id, error = %failure.detail, "transport failure");
                }
                return Err(NormalizedError::network(id, failure.summary));
            }
        };
        event.status = Some(status.as_u16());

        if let Some(info) = rate_limit::parse_at(id, &headers, limit, self.clock.now_ms()) {
            event.rate_limit = Some(self.store.update(key, info));
        }

        ErrorNormalizer::new(id, exchange.error_codes())
            .with_rule(exchange.response_error())
            .handle_at(status, headers, body, self.clock.now_ms())
    }

    fn sign(
        &self,
        exchange: &Exchange,
        request: &Request,
        credentials: &Credentials,
        base_url: String,
    ) -> Result<SignedRequest, NormalizedError> {
        let id = exchange.id();
        let signer = exchange.signer().ok_or_else(|| {
            NormalizedError::new(id, ErrorKind::NotSupported, "exchange has no signing configuration")
        })?;
        let context = SignContext::new(base_url)
            .with_clock(Arc::clone(&self.clock))
            .with_nonce(exchange.nonce());

        let outcome = signer
            .sign(request, credentials, &context)
            .map_err(|e| NormalizedError::from_signing(id, e))?;
        let mut signed = match outcome {
            SignOutcome::Http(signed) => signed,
            SignOutcome::WebSocket(_) => {
                return Err(NormalizedError::new(
                    id,
                    ErrorKind::NotSupported,
                    format!(
                        "{} authenticates WebSocket connections, not REST requests",
                        signer.pattern()
                    ),
                ));
            }
            SignOutcome::NeedsExternalCall(call) => {
                return Err(NormalizedError::new(
                    id,
                    ErrorKind::NotSupported,
                    format!(
                        "{} needs a token from {} {} first",
                        signer.pattern(),
                        call.method,
                        call.endpoint
                    ),
                ));
            }
        };
        apply_static_headers(exchange, &mut signed);
        Ok(signed)
    }

    async fn send(
        &self,
        exchange: &str,
        request: SignedRequest,
        headers: HeaderMap,
        retry: RetryMode,
        timeout: Duration,
    ) -> Result<(StatusCode, HeaderMap, String), TransportFailure> {
        let client = match retry {
            RetryMode::Transient => &self.http,
            RetryMode::Disabled => &self.http_no_retry,
        };

        let mut builder = client.request(request.method, &request.url).headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let exchange_call = async {
            let response = builder.send().await.map_err(TransportFailure::from_middleware)?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.text().await.map_err(TransportFailure::from_reqwest)?;
            Ok((status, headers, body))
        };

        match tokio::time::timeout(timeout, exchange_call).await {
            Ok(result) => result,
            Err(_) => Err(TransportFailure {
                summary: format!("request timed out after {}ms", timeout.as_millis()),
                detail: format!("{exchange}: timeout after {timeout:?}"),
            }),
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("timeout", &self.timeout)
            .field("tracked_keys", &self.limiter.tracked_keys())
            .finish()
    }
}

/// A request with no credentials: JSON content type plus the exchange's
/// static headers.
fn unsigned(exchange: &Exchange, request: &Request, base_url: &str) -> Result<SignedRequest, NormalizedError> {
    let parts = RequestParts::json(request).map_err(|e| NormalizedError::from_signing(exchange.id(), e))?;
    let mut prepared = SignedRequest {
        url: join_url(base_url, &request.path, &parts.query),
        method: request.method.clone(),
        headers: vec![(CONTENT_TYPE.to_string(), "application/json".to_string())],
        body: parts.body,
    };
    apply_static_headers(exchange, &mut prepared);
    Ok(prepared)
}

/// Add the exchange's static headers where the request has not set them.
fn apply_static_headers(exchange: &Exchange, request: &mut SignedRequest) {
    for (name, value) in exchange.static_headers() {
        match value.to_str() {
            Ok(value) => request.set_default_header(name.as_str(), value),
            Err(_) => tracing::debug!(exchange = exchange.id(), header = %name, "skipping non-text static header"),
        }
    }
}

/// Convert signer output into a `HeaderMap`. A value that is not a valid
/// header comes from the credentials, so it is reported without the value.
fn header_map(exchange: &str, headers: &[(String, String)]) -> Result<HeaderMap, NormalizedError> {
    let invalid = |name: &str| {
        NormalizedError::new(
            exchange,
            ErrorKind::InvalidCredentials,
            format!("header {name} has an invalid value"),
        )
    };
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid(name))?;
        let value = HeaderValue::from_str(value).map_err(|_| invalid(name))?;
        map.append(header, value);
    }
    Ok(map)
}

/// A transport failure, with a summary safe to return to callers and a
/// detail that is only logged in debug mode.
struct TransportFailure {
    summary: String,
    detail: String,
}

impl TransportFailure {
    fn from_reqwest(error: reqwest::Error) -> Self {
        let summary = if error.is_timeout() {
            "request timed out".to_string()
        } else if error.is_connect() {
            "connection failed".to_string()
        } else if error.is_body() || error.is_decode() {
            "failed to read response body".to_string()
        } else {
            "request failed".to_string()
        };
        Self {
            summary,
            detail: error.without_url().to_string(),
        }
    }

    fn from_middleware(error: reqwest_middleware::Error) -> Self {
        match error {
            reqwest_middleware::Error::Reqwest(error) => Self::from_reqwest(error),
            reqwest_middleware::Error::Middleware(error) => Self {
                summary: "request failed".to_string(),
                detail: error.to_string(),
            },
        }
    }
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    user_agent: Option<String>,
    max_retries: u32,
    timeout: Duration,
    clock: Option<Arc<dyn Clock>>,
    limiter: Option<Arc<RateLimiter>>,
    breaker: Option<Arc<CircuitBreaker>>,
    breaker_config: CircuitBreakerConfig,
    store: Option<Arc<RateLimitStore>>,
    telemetry: Option<Arc<dyn Telemetry>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            user_agent: None,
            max_retries: 3,
            timeout: DEFAULT_TIMEOUT,
            clock: None,
            limiter: None,
            breaker: None,
            breaker_config: CircuitBreakerConfig::default(),
            store: None,
            telemetry: None,
        }
    }

    /// Default user agent; an exchange's own `user_agent` takes precedence.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set the maximum number of retries for transient failures.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Transport timeout used when neither the call nor the exchange sets one.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Clock for signing timestamps and for the default limiter and breaker.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share a rate limiter between pipelines.
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Share a circuit breaker between pipelines.
    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Configure the default circuit breaker. Ignored when one is supplied.
    pub fn circuit_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn rate_limit_store(mut self, store: Arc<RateLimitStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Build the pipeline, falling back to a default HTTP client when the
    /// configured one cannot be built.
    pub fn build(self) -> Pipeline {
        let user_agent = self.user_agent_value();
        let header_value = HeaderValue::from_str(&user_agent).unwrap_or_else(|_| {
            tracing::warn!("invalid user agent, using the default");
            HeaderValue::from_static("exchange-pipeline")
        });
        let reqwest_client = http_client(header_value).unwrap_or_else(|error| {
            tracing::warn!(%error, "failed to build HTTP client, using defaults");
            reqwest::Client::new()
        });
        self.assemble(reqwest_client)
    }

    /// Build the pipeline, reporting an invalid user agent or a failed HTTP
    /// client instead of falling back.
    pub fn try_build(self) -> Result<Pipeline, ConfigError> {
        let user_agent = self.user_agent_value();
        let header_value = HeaderValue::from_str(&user_agent)
            .map_err(|_| ConfigError::InvalidHeader(USER_AGENT.as_str().to_string()))?;
        let reqwest_client = http_client(header_value)?;
        Ok(self.assemble(reqwest_client))
    }

    fn user_agent_value(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("exchange-pipeline/{}", env!("CARGO_PKG_VERSION")))
    }

    fn assemble(self, reqwest_client: reqwest::Client) -> Pipeline {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(self.max_retries);

        let http = ClientBuilder::new(reqwest_client.clone())
            .with(TracingMiddleware::default())
            .with(RetryTransientMiddleware::new_with_policy_and_strategy(
                retry_policy,
                SkipTooManyRequests,
            ))
            .build();
        let http_no_retry = ClientBuilder::new(reqwest_client)
            .with(TracingMiddleware::default())
            .build();

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let limiter = self
            .limiter
            .unwrap_or_else(|| Arc::new(RateLimiter::with_clock(Arc::clone(&clock))));
        let breaker = self.breaker.unwrap_or_else(|| {
            Arc::new(CircuitBreaker::with_clock(self.breaker_config, Arc::clone(&clock)))
        });

        Pipeline {
            http,
            http_no_retry,
            limiter,
            breaker,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(RateLimitStore::with_clock(Arc::clone(&clock)))),
            telemetry: self.telemetry.unwrap_or_else(|| Arc::new(TracingTelemetry)),
            clock,
            timeout: self.timeout,
        }
    }
}

fn http_client(user_agent: HeaderValue) -> Result<reqwest::Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, user_agent);
    reqwest::Client::builder().default_headers(headers).build()
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::signing::CustomSigners;

    fn exchange(json: &str) -> Exchange {
        Exchange::from_json(json, &CustomSigners::new()).unwrap()
    }

    #[test]
    fn test_options_defaults() {
        let options = RequestOptions::new();
        assert_eq!(options.cost, 1);
        assert_eq!(options.effective_retry(), RetryMode::Transient);
        assert!(!options.use_sandbox());
        assert_eq!(
            RequestOptions::new()
                .credentials(Credentials::new("k", "s"))
                .effective_retry(),
            RetryMode::Disabled
        );
        assert_eq!(
            RequestOptions::new()
                .credentials(Credentials::new("k", "s"))
                .retry(RetryMode::Transient)
                .effective_retry(),
            RetryMode::Transient
        );
        assert!(
            RequestOptions::new()
                .credentials(Credentials::new("k", "s").with_sandbox(true))
                .use_sandbox()
        );
    }

    #[test]
    fn test_unsigned_request_shape() {
        let exchange = exchange(
            r#"{
                "id": "bybit",
                "urls": { "api": { "rest": "https://api.bybit.com" } },
                "headers": { "X-Referer": "partner" },
                "user_agent": "custom-agent"
            }"#,
        );

        let get = Request::get("/v5/market/tickers").param("category", "spot").param("symbol", "BTCUSDT");
        let prepared = unsigned(&exchange, &get, "https://api.bybit.com").unwrap();
        assert_eq!(
            prepared.url,
            "https://api.bybit.com/v5/market/tickers?category=spot&symbol=BTCUSDT"
        );
        assert_eq!(prepared.header("content-type"), Some("application/json"));
        assert_eq!(prepared.header("x-referer"), Some("partner"));
        assert_eq!(prepared.header("user-agent"), Some("custom-agent"));
        assert_eq!(prepared.body, None);

        let post = Request::post("/v5/order/create").param("qty", "1");
        let prepared = unsigned(&exchange, &post, "https://api.bybit.com/").unwrap();
        assert_eq!(prepared.url, "https://api.bybit.com/v5/order/create");
        assert_eq!(prepared.body.as_deref(), Some(r#"{"qty":"1"}"#));

        let explicit = Request::post("/v5/order/create").body(json!({"orders": []}));
        let prepared = unsigned(&exchange, &explicit, "https://api.bybit.com").unwrap();
        assert_eq!(prepared.body.as_deref(), Some(r#"{"orders":[]}"#));
    }

    #[test]
    fn test_header_map_rejects_control_characters() {
        let headers = vec![
            ("X-API-KEY".to_string(), "abc\ndef".to_string()),
        ];
        let error = header_map("okx", &headers).unwrap_err();
        assert_eq!(error.kind, ErrorKind::InvalidCredentials);
        assert!(!error.message.contains("abc"));

        let ok = vec![("X-API-KEY".to_string(), "abc".to_string())];
        assert_eq!(header_map("okx", &ok).unwrap()["x-api-key"], "abc");
    }

    #[tokio::test]
    async fn test_credentials_without_signing_config() {
        let exchange = exchange(r#"{ "id": "plain", "urls": { "api": { "rest": "http://127.0.0.1:1" } } }"#);
        let pipeline = Pipeline::new();
        let error = pipeline
            .request(
                &exchange,
                Method::GET,
                "/private",
                RequestOptions::new().credentials(Credentials::new("k", "s")),
            )
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::NotSupported);
    }

    #[tokio::test]
    async fn test_two_phase_pattern_is_not_a_rest_signer() {
        let exchange = exchange(
            r#"{
                "id": "binance",
                "urls": { "api": { "rest": "http://127.0.0.1:1" } },
                "signing": { "pattern": "ws_listen_key" }
            }"#,
        );
        let error = Pipeline::new()
            .request(
                &exchange,
                Method::GET,
                "/ws",
                RequestOptions::new().credentials(Credentials::new("k", "s")),
            )
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::NotSupported);
        assert!(error.message.contains("/api/v3/userDataStream"));
    }

    #[test]
    fn test_try_build_rejects_invalid_user_agent() {
        let error = Pipeline::builder().user_agent("bad\nagent").try_build().unwrap_err();
        assert!(matches!(error, ConfigError::InvalidHeader(name) if name == "user-agent"));
        assert!(Pipeline::builder().user_agent("good-agent/1.0").try_build().is_ok());
    }

    #[tokio::test]
    async fn test_cost_above_capacity_is_rejected_before_sending() {
        let exchange = exchange(
            r#"{
                "id": "kraken",
                "urls": { "api": { "rest": "http://127.0.0.1:1" } },
                "rate_limits": { "requests": 5, "period": 1000 }
            }"#,
        );
        let pipeline = Pipeline::new();
        let error = pipeline
            .request(&exchange, Method::GET, "/0/public/Time", RequestOptions::new().cost(50))
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::InvalidParameters);
        assert!(error.message.contains("50"));
        assert_eq!(pipeline.rate_limiter().used(&RateLimitKey::public("kraken")), 0);
        assert_eq!(pipeline.circuit_breaker().state("kraken").failure_count, 0);
    }

    #[test]
    fn test_cleanup_evicts_idle_snapshots() {
        use crate::clock::ManualClock;
        use crate::rate_limit::HeaderSource;

        let clock = Arc::new(ManualClock::new(0));
        let pipeline = Pipeline::builder().clock(clock.clone()).build();
        let key = RateLimitKey::api_key("okx", "k1");
        pipeline.rate_limit_store().update(
            key.clone(),
            RateLimitInfo {
                exchange: "okx".into(),
                limit: Some(20),
                used: Some(1),
                remaining: Some(19),
                reset_at_ms: None,
                source: HeaderSource::Generic,
                raw_headers: vec![],
            },
        );
        pipeline
            .rate_limiter()
            .check(&key, Some(&LimitConfig::new(5, 1_000)), 1);

        clock.advance(23 * 60 * 60 * 1_000);
        assert_eq!(pipeline.cleanup(Duration::from_secs(60)), 0);
        clock.advance(2 * 60 * 60 * 1_000);
        assert_eq!(pipeline.cleanup(Duration::from_secs(60)), 2);
        assert!(pipeline.rate_limit_store().is_empty());
        assert_eq!(pipeline.rate_limiter().tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_missing_sandbox_url() {
        let exchange = exchange(r#"{ "id": "x", "urls": { "api": { "rest": "http://127.0.0.1:1" } } }"#);
        let error = Pipeline::new()
            .request(&exchange, Method::GET, "/", RequestOptions::new().sandbox(true))
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::NotSupported);
    }
}
