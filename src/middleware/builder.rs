use crate::backend::{Admission, Backend};
use crate::middleware::{AllowedTransformation, DeniedResponse, RateLimiter, RollbackCondition};
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_WINDOW: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-window"));

/// Body of the response to a denied request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeniedBody {
    pub error: &'static str,
    /// Seconds, the length of the window.
    pub retry_after: u64,
}

pub struct RateLimiterBuilder<BE, BO, F> {
    backend: BE,
    input_fn: F,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation<BO>>>,
    denied_response: Rc<DeniedResponse<BO>>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<BE, BI, BO, F, O> RateLimiterBuilder<BE, BO, F>
where
    BE: Backend<BI, Output = BO> + 'static,
    BI: 'static,
    F: Fn(&ServiceRequest) -> O,
    O: Future<Output = Result<Admission<BI>, actix_web::Error>>,
{
    pub(super) fn new(backend: BE, input_fn: F) -> Self {
        Self {
            backend,
            input_fn,
            fail_open: false,
            allowed_transformation: None,
            denied_response: Rc::new(|_: &BO| HttpResponse::TooManyRequests().finish()),
            rollback_condition: None,
        }
    }

    /// Choose whether to allow a request if the backend returns a failure.
    ///
    /// Default is false.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Sets the [RateLimiterBuilder::request_allowed_transformation] and
    /// [RateLimiterBuilder::request_denied_response] functions, such that the following headers
    /// are set in both the allowed and denied responses:
    ///
    /// - `x-ratelimit-limit`\
    /// - `x-ratelimit-window` (e.g. `1m30s`)\
    /// - `x-ratelimit-remaining`\
    /// - `retry-after` (denied only, seconds in one window)
    ///
    /// Denied responses get a JSON [DeniedBody], e.g.
    /// `{"error": "rate limit exceeded", "retry_after": 60}`.
    ///
    /// This function requires the Backend Output to implement [HeaderCompatibleOutput]
    pub fn add_headers(mut self) -> Self
    where
        BO: HeaderCompatibleOutput,
    {
        self.allowed_transformation = Some(Rc::new(|map: &mut HeaderMap, output: Option<&BO>| {
            if let Some(status) = output {
                insert_headers(map, status);
            }
        }));
        self.denied_response = Rc::new(|status: &BO| {
            let retry_after = retry_after_secs(status.window());
            let mut response = HttpResponse::TooManyRequests().json(DeniedBody {
                error: "rate limit exceeded",
                retry_after,
            });
            let map = response.headers_mut();
            insert_headers(map, status);
            map.insert(RETRY_AFTER, HeaderValue::from(retry_after));
            response
        });
        self
    }

    /// In the event that the request is allowed:
    ///
    /// You can optionally mutate the response headers to include the rate limit status.
    ///
    /// By default no changes are made to the response.
    ///
    /// Note the [Backend::Output] will be [None] if the backend failed and
    /// [RateLimiterBuilder::fail_open] is enabled.
    pub fn request_allowed_transformation<M>(mut self, mutation: Option<M>) -> Self
    where
        M: Fn(&mut HeaderMap, Option<&BO>) + 'static,
    {
        self.allowed_transformation = mutation.map(|m| Rc::new(m) as Rc<AllowedTransformation<BO>>);
        self
    }

    /// In the event that the request is denied, configure the [HttpResponse] returned.
    ///
    /// Defaults to an empty body with status 429.
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&BO) -> HttpResponse + 'static,
    {
        self.denied_response = Rc::new(denied_response);
        self
    }

    /// After processing a request, attempt to rollback the admission based on the status code
    /// of the returned response.
    ///
    /// By default an admission is never rolled back.
    pub fn rollback_condition<C>(mut self, condition: Option<C>) -> Self
    where
        C: Fn(StatusCode) -> bool + 'static,
    {
        self.rollback_condition = condition.map(|m| Rc::new(m) as Rc<RollbackCondition>);
        self
    }

    /// Configures the [RateLimiterBuilder::rollback_condition] to rollback if the status code
    /// is a server error (5xx).
    pub fn rollback_server_errors(mut self) -> Self {
        self.rollback_condition = Some(Rc::new(|status: StatusCode| status.is_server_error()));
        self
    }

    pub fn build(self) -> RateLimiter<BE, BO, F> {
        RateLimiter {
            backend: self.backend,
            input_fn: Rc::new(self.input_fn),
            fail_open: self.fail_open,
            allowed_mutation: self.allowed_transformation,
            denied_response: self.denied_response,
            rollback_condition: self.rollback_condition,
        }
    }
}

fn insert_headers<O: HeaderCompatibleOutput>(map: &mut HeaderMap, status: &O) {
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(status.limit()));
    if let Ok(window) = HeaderValue::from_str(&format_window(status.window())) {
        map.insert(X_RATELIMIT_WINDOW.clone(), window);
    }
    map.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(status.remaining()),
    );
}

/// Whole seconds in a window, rounded upwards so that waiting this long always suffices.
fn retry_after_secs(window: Duration) -> u64 {
    let millis = window.as_millis() as f64;
    (millis / 1000f64).ceil() as u64
}

/// Compact human readable form of a window, e.g. `1h30m`, `45s`, `1s500ms`.
pub fn format_window(window: Duration) -> String {
    let secs = window.as_secs();
    let parts = [
        (secs / 3600, "h"),
        (secs / 60 % 60, "m"),
        (secs % 60, "s"),
        (u64::from(window.subsec_millis()), "ms"),
    ];
    let formatted: String = parts
        .iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{value}{unit}"))
        .collect();
    if formatted.is_empty() {
        "0s".to_owned()
    } else {
        formatted
    }
}

/// A trait that a [Backend::Output] should implement in order to use the
/// [RateLimiterBuilder::add_headers] function.
pub trait HeaderCompatibleOutput {
    /// Value for the `x-ratelimit-limit` header.
    fn limit(&self) -> u64;

    /// Value for the `x-ratelimit-remaining` header.
    fn remaining(&self) -> u64;

    /// The window the limit applies to, used for the `x-ratelimit-window` and `retry-after`
    /// headers.
    fn window(&self) -> Duration;
}
