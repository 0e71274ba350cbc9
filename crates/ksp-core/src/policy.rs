use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    time::{Duration, Instant},
};

use http::{header, Request, StatusCode};
use ksp_plugin_sdk::{RateLimit, RequestValidation, RouteDecl};
use parking_lot::Mutex;
use serde_json::Value;

/// Checks the host runs for one mounted route before dispatching to the
/// plugin.
#[derive(Debug, Default)]
pub struct RoutePolicy {
    validation: Option<RequestValidation>,
    limiter: Option<RateLimiter>,
}

/// Why a request was turned away before reaching the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub reason: String,
    pub retry_after: Option<Duration>,
}

impl Rejection {
    fn bad_request(reason: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            reason: reason.into(),
            retry_after: None,
        }
    }
}

impl RoutePolicy {
    pub fn from_decl(decl: &RouteDecl) -> Self {
        Self {
            validation: decl.validation.clone(),
            limiter: decl.rate_limit.map(RateLimiter::new),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.validation.is_none() && self.limiter.is_none()
    }

    /// Validation runs first so malformed requests do not use up the
    /// client's allowance.
    pub fn check<B: AsRef<[u8]>>(
        &self,
        request: &Request<B>,
        client: IpAddr,
    ) -> Result<(), Rejection> {
        if let Some(validation) = &self.validation {
            validate(validation, request)?;
        }
        if let Some(limiter) = &self.limiter {
            limiter.acquire(client, Instant::now())?;
        }
        Ok(())
    }
}

fn validate<B: AsRef<[u8]>>(rules: &RequestValidation, request: &Request<B>) -> Result<(), Rejection> {
    if !rules.content_type.is_empty() {
        let content_type = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !rules
            .content_type
            .iter()
            .any(|accepted| content_type.contains(accepted.as_str()))
        {
            return Err(Rejection::bad_request(format!(
                "invalid content type, expected one of {}",
                rules.content_type.join(", ")
            )));
        }
    }
    if !rules.required.is_empty() {
        let body: serde_json::Map<String, Value> = serde_json::from_slice(request.body().as_ref())
            .map_err(|_| Rejection::bad_request("invalid JSON payload"))?;
        if let Some(missing) = rules.required.iter().find(|field| !body.contains_key(*field)) {
            return Err(Rejection::bad_request(format!(
                "required field `{missing}` is missing"
            )));
        }
    }
    Ok(())
}

/// Sliding-window counter keyed by client address.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    hits: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit: limit.requests as usize,
            window: Duration::from_millis(limit.window_ms),
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquire(&self, client: IpAddr, now: Instant) -> Result<(), Rejection> {
        let mut hits = self.hits.lock();
        // Forget clients whose window has fully passed.
        hits.retain(|_, times| {
            times
                .back()
                .is_some_and(|last| now.saturating_duration_since(*last) < self.window)
        });
        let times = hits.entry(client).or_default();
        while times
            .front()
            .is_some_and(|first| now.saturating_duration_since(*first) >= self.window)
        {
            times.pop_front();
        }
        if times.len() >= self.limit {
            let retry_after = times
                .front()
                .map(|first| self.window.saturating_sub(now.saturating_duration_since(*first)));
            return Err(Rejection {
                status: StatusCode::TOO_MANY_REQUESTS,
                reason: "rate limit exceeded".into(),
                retry_after,
            });
        }
        times.push_back(now);
        Ok(())
    }
}
