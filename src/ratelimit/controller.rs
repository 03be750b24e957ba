//! Per-request admission decisions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{trace, warn};

use super::key::{ClientAddressKey, KeyDeriver, RequestAttributes};
use super::store::WindowedCounterStore;

/// Message sent to rejected clients when a policy does not set its own.
pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Fixed `error` category in rejection bodies.
pub const REJECTION_ERROR: &str = "Too Many Requests";

/// Decides whether a request bypasses accounting entirely.
pub trait SkipPredicate: Send + Sync {
    /// Return `true` to admit the request without counting it.
    fn should_skip(&self, request: &RequestAttributes) -> bool;
}

impl<F> SkipPredicate for F
where
    F: Fn(&RequestAttributes) -> bool + Send + Sync,
{
    fn should_skip(&self, request: &RequestAttributes) -> bool {
        self(request)
    }
}

/// Configuration for one admission policy.
#[derive(Clone)]
pub struct AdmissionConfig {
    /// Requests allowed per window; the next one is rejected
    pub max_requests: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Human-readable rejection message
    pub message: String,
    /// Strategy mapping requests to accounting keys
    pub key_deriver: Arc<dyn KeyDeriver>,
    /// Optional bypass for trusted callers
    pub skip: Option<Arc<dyn SkipPredicate>>,
    /// Whether rate limit headers are produced
    pub headers: bool,
}

impl AdmissionConfig {
    /// A policy keyed by client address with default message and headers on.
    pub fn new(max_requests: u64, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
            message: DEFAULT_MESSAGE.to_string(),
            key_deriver: Arc::new(ClientAddressKey),
            skip: None,
            headers: true,
        }
    }

    /// Set the rejection message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Replace the key deriver.
    pub fn with_key_deriver(mut self, deriver: impl KeyDeriver + 'static) -> Self {
        self.key_deriver = Arc::new(deriver);
        self
    }

    /// Install a skip predicate.
    pub fn with_skip(mut self, skip: impl SkipPredicate + 'static) -> Self {
        self.skip = Some(Arc::new(skip));
        self
    }

    /// Turn rate limit headers on or off.
    pub fn with_headers(mut self, headers: bool) -> Self {
        self.headers = headers;
        self
    }

    /// The window as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl fmt::Debug for AdmissionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionConfig")
            .field("max_requests", &self.max_requests)
            .field("window_ms", &self.window_ms)
            .field("message", &self.message)
            .field("skip", &self.skip.is_some())
            .field("headers", &self.headers)
            .finish()
    }
}

/// Header values to attach to the response for a counted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// Configured maximum
    pub limit: u64,
    /// Requests left in the window, floored at zero
    pub remaining: u64,
    /// Window end in epoch seconds
    pub reset: u64,
    /// Only present on rejection
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    /// Header carrying [`RateLimitHeaders::limit`].
    pub const LIMIT: &'static str = "X-RateLimit-Limit";
    /// Header carrying [`RateLimitHeaders::remaining`].
    pub const REMAINING: &'static str = "X-RateLimit-Remaining";
    /// Header carrying [`RateLimitHeaders::reset`].
    pub const RESET: &'static str = "X-RateLimit-Reset";
    /// Header carrying [`RateLimitHeaders::retry_after`], in seconds.
    pub const RETRY_AFTER: &'static str = "Retry-After";

    /// Header name/value pairs in emission order.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (Self::LIMIT, self.limit.to_string()),
            (Self::REMAINING, self.remaining.to_string()),
            (Self::RESET, self.reset.to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            pairs.push((Self::RETRY_AFTER, retry_after.to_string()));
        }
        pairs
    }
}

/// Outcome of [`AdmissionController::decide`].
///
/// Skipped requests are admitted with `key == None`, a zero count and a
/// zero reset time; nothing was recorded for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionResult {
    pub allowed: bool,
    /// Accounting key, `None` when the request was skipped
    pub key: Option<String>,
    /// Requests recorded in the window, including this one
    pub count: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Window end in epoch milliseconds
    pub reset_time: u64,
    pub retry_after_secs: u64,
    /// Present when the policy emits headers and the request was counted
    pub headers: Option<RateLimitHeaders>,
}

impl AdmissionResult {
    fn skipped(limit: u64) -> Self {
        Self {
            allowed: true,
            key: None,
            count: 0,
            limit,
            remaining: limit,
            reset_time: 0,
            retry_after_secs: 0,
            headers: None,
        }
    }

    /// Whether the request bypassed accounting.
    pub fn is_skipped(&self) -> bool {
        self.key.is_none()
    }
}

/// JSON body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectionBody {
    pub error: String,
    pub message: String,
    #[serde(rename = "retryAfter")]
    pub retry_after: u64,
}

/// Applies one admission policy against a shared counter store.
pub struct AdmissionController {
    policy: String,
    config: AdmissionConfig,
    store: Arc<WindowedCounterStore>,
}

impl AdmissionController {
    /// Create a controller for the named policy.
    pub fn new(
        policy: impl Into<String>,
        config: AdmissionConfig,
        store: Arc<WindowedCounterStore>,
    ) -> Self {
        Self {
            policy: policy.into(),
            config,
            store,
        }
    }

    /// Policy name, used in log events.
    pub fn policy(&self) -> &str {
        &self.policy
    }

    /// The policy's configuration.
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// The shared counter store.
    pub fn store(&self) -> &Arc<WindowedCounterStore> {
        &self.store
    }

    /// Count the request and decide whether to admit it.
    ///
    /// Over-limit requests are counted too, so a client that keeps retrying
    /// stays rejected until the window ends.
    pub fn decide(&self, request: &RequestAttributes) -> AdmissionResult {
        let limit = self.config.max_requests;

        if let Some(skip) = &self.config.skip {
            if skip.should_skip(request) {
                trace!(policy = %self.policy, "Request skipped rate limiting");
                return AdmissionResult::skipped(limit);
            }
        }

        let key = self.config.key_deriver.derive(request);
        let now = self.store.clock().now_ms();
        let entry = self.store.increment_at(&key, self.config.window_ms, now);

        let allowed = entry.count <= limit;
        let remaining = limit.saturating_sub(entry.count);
        let retry_after_secs = entry.time_until_reset(now).div_ceil(1000);

        let headers = self.config.headers.then(|| RateLimitHeaders {
            limit,
            remaining,
            reset: entry.reset_time.div_ceil(1000),
            retry_after: (!allowed).then_some(retry_after_secs),
        });

        if allowed {
            trace!(
                policy = %self.policy,
                key = %key,
                count = entry.count,
                limit = limit,
                "Request admitted"
            );
        } else {
            warn!(
                policy = %self.policy,
                key = %key,
                count = entry.count,
                limit = limit,
                retry_after = retry_after_secs,
                "Rate limit exceeded"
            );
        }

        AdmissionResult {
            allowed,
            key: Some(key),
            count: entry.count,
            limit,
            remaining,
            reset_time: entry.reset_time,
            retry_after_secs,
            headers,
        }
    }

    /// Body to send with a rejection.
    pub fn rejection(&self, result: &AdmissionResult) -> RejectionBody {
        RejectionBody {
            error: REJECTION_ERROR.to_string(),
            message: self.config.message.clone(),
            retry_after: result.retry_after_secs,
        }
    }
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("policy", &self.policy)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::key::NamespacedKey;

    const START_MS: u64 = 1_700_000_000_000;

    fn setup(config: AdmissionConfig) -> (Arc<ManualClock>, AdmissionController) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = Arc::new(WindowedCounterStore::new(clock.clone()));
        (clock, AdmissionController::new("test", config, store))
    }

    fn client(addr: &str) -> RequestAttributes {
        RequestAttributes::default().with_client_addr(addr)
    }

    #[test]
    fn test_two_per_minute_scenario() {
        let (_clock, controller) = setup(AdmissionConfig::new(2, 60_000));
        let request = client("10.0.0.1");

        let first = controller.decide(&request);
        assert_eq!((first.count, first.allowed, first.remaining), (1, true, 1));

        let second = controller.decide(&request);
        assert_eq!((second.count, second.allowed, second.remaining), (2, true, 0));

        let third = controller.decide(&request);
        assert_eq!((third.count, third.allowed, third.remaining), (3, false, 0));
        assert_eq!(third.retry_after_secs, 60);
    }

    #[test]
    fn test_limit_boundary_is_allowed() {
        let (_clock, controller) = setup(AdmissionConfig::new(5, 1_000));
        let request = client("10.0.0.1");

        for i in 1..=5 {
            assert!(controller.decide(&request).allowed, "request {} should pass", i);
        }
        assert!(!controller.decide(&request).allowed);
    }

    #[test]
    fn test_rejected_requests_keep_counting() {
        let (_clock, controller) = setup(AdmissionConfig::new(1, 1_000));
        let request = client("10.0.0.1");

        controller.decide(&request);
        controller.decide(&request);
        let result = controller.decide(&request);

        assert!(!result.allowed);
        assert_eq!(result.count, 3);
        assert_eq!(
            controller.store().peek(result.key.as_deref().unwrap()).map(|e| e.count),
            Some(3)
        );
    }

    #[test]
    fn test_keys_do_not_interfere() {
        let (_clock, controller) = setup(AdmissionConfig::new(1, 1_000));

        assert!(controller.decide(&client("10.0.0.1")).allowed);
        assert!(!controller.decide(&client("10.0.0.1")).allowed);
        assert!(controller.decide(&client("10.0.0.2")).allowed);
    }

    #[test]
    fn test_window_expiry_restores_quota() {
        let (clock, controller) = setup(AdmissionConfig::new(1, 1_000));
        let request = client("10.0.0.1");

        controller.decide(&request);
        assert!(!controller.decide(&request).allowed);

        clock.advance(1_000);
        let result = controller.decide(&request);
        assert!(result.allowed);
        assert_eq!(result.count, 1);
    }

    #[test]
    fn test_rejection_does_not_extend_window() {
        let (clock, controller) = setup(AdmissionConfig::new(1, 1_000));
        let request = client("10.0.0.1");

        let first = controller.decide(&request);
        clock.advance(900);
        let rejected = controller.decide(&request);

        assert_eq!(first.reset_time, rejected.reset_time);
        assert_eq!(rejected.retry_after_secs, 1);
    }

    #[test]
    fn test_remaining_is_monotonic() {
        let (_clock, controller) = setup(AdmissionConfig::new(5, 60_000));
        let request = client("10.0.0.1");

        let mut previous = u64::MAX;
        for _ in 0..10 {
            let result = controller.decide(&request);
            assert!(result.remaining <= previous);
            previous = result.remaining;
        }
        assert_eq!(previous, 0);
    }

    #[test]
    fn test_skip_bypasses_store() {
        let config = AdmissionConfig::new(1, 60_000)
            .with_skip(|request: &RequestAttributes| request.param("internal") == Some("yes"));
        let (_clock, controller) = setup(config);

        let request = client("10.0.0.1");
        controller.decide(&request);
        controller.decide(&request);
        assert!(!controller.decide(&request).allowed);

        let trusted = client("10.0.0.1").with_param("internal", "yes");
        for _ in 0..3 {
            let result = controller.decide(&trusted);
            assert!(result.allowed);
            assert!(result.is_skipped());
            assert!(result.headers.is_none());
        }

        assert_eq!(controller.store().peek("10.0.0.1").map(|e| e.count), Some(3));
    }

    #[test]
    fn test_headers_on_allowed_and_rejected() {
        let (_clock, controller) = setup(AdmissionConfig::new(1, 60_000));
        let request = client("10.0.0.1");

        let allowed = controller.decide(&request).headers.unwrap();
        assert_eq!(
            allowed,
            RateLimitHeaders {
                limit: 1,
                remaining: 0,
                reset: (START_MS + 60_000) / 1000,
                retry_after: None,
            }
        );
        assert_eq!(allowed.pairs().len(), 3);

        let rejected = controller.decide(&request).headers.unwrap();
        assert_eq!(rejected.retry_after, Some(60));
        assert_eq!(
            rejected.pairs().last(),
            Some(&(RateLimitHeaders::RETRY_AFTER, "60".to_string()))
        );
    }

    #[test]
    fn test_reset_header_rounds_up() {
        let clock = Arc::new(ManualClock::new(1_500));
        let store = Arc::new(WindowedCounterStore::new(clock));
        let controller = AdmissionController::new("test", AdmissionConfig::new(1, 1_000), store);

        let result = controller.decide(&client("10.0.0.1"));
        assert_eq!(result.reset_time, 2_500);
        assert_eq!(result.headers.unwrap().reset, 3);
    }

    #[test]
    fn test_headers_disabled() {
        let (_clock, controller) = setup(AdmissionConfig::new(1, 60_000).with_headers(false));
        let request = client("10.0.0.1");

        assert!(controller.decide(&request).headers.is_none());
        assert!(controller.decide(&request).headers.is_none());
    }

    #[test]
    fn test_rejection_body() {
        let (_clock, controller) =
            setup(AdmissionConfig::new(0, 30_000).with_message("Slow down."));

        let result = controller.decide(&client("10.0.0.1"));
        assert!(!result.allowed);

        let body = serde_json::to_value(controller.rejection(&result)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "error": "Too Many Requests",
                "message": "Slow down.",
                "retryAfter": 30
            })
        );
    }

    #[test]
    fn test_policies_share_store_through_namespaces() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = Arc::new(WindowedCounterStore::new(clock));

        let access = AdmissionController::new(
            "access",
            AdmissionConfig::new(1, 60_000)
                .with_key_deriver(NamespacedKey::new("access", ClientAddressKey)),
            store.clone(),
        );
        let download = AdmissionController::new(
            "download",
            AdmissionConfig::new(1, 60_000)
                .with_key_deriver(NamespacedKey::new("download", ClientAddressKey)),
            store.clone(),
        );

        let request = client("10.0.0.1");
        assert!(access.decide(&request).allowed);
        assert!(download.decide(&request).allowed);
        assert!(!access.decide(&request).allowed);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_unknown_clients_share_a_bucket() {
        let (_clock, controller) = setup(AdmissionConfig::new(1, 60_000));

        let first = controller.decide(&RequestAttributes::default());
        let second = controller.decide(&RequestAttributes::default());

        assert_eq!(first.key.as_deref(), Some("unknown"));
        assert!(!second.allowed);
    }
}
