//! Ready made limiters driven by a [RateLimitConfig].
//!
//! All three add the `x-ratelimit-*` headers to admitted responses and deny with a JSON `429`,
//! see [RateLimiterBuilder::add_headers](crate::RateLimiterBuilder::add_headers).

use crate::backend::{
    Backend, InputFunctionBuilder, InputFuture, KeyStrategy, SlidingWindowInput,
    SlidingWindowOutput,
};
use crate::policy::RateLimitConfig;
use crate::RateLimiter;
use actix_web::dev::ServiceRequest;
use std::sync::Arc;

/// Limits every request by user or IP, per the config's `user_based` flag.
pub fn global<BA>(
    backend: BA,
    config: Arc<RateLimitConfig>,
) -> RateLimiter<BA, SlidingWindowOutput, impl Fn(&ServiceRequest) -> InputFuture + 'static>
where
    BA: Backend<SlidingWindowInput, Output = SlidingWindowOutput> + 'static,
{
    let input = InputFunctionBuilder::new(config).build();
    RateLimiter::builder(backend, input).add_headers().build()
}

/// Limits by client IP only, ignoring any authenticated user.
///
/// Meant for routes reached before authentication, such as a login form. Keys are prefixed
/// with `ip_only` so the counts stay apart from a [global] limiter on the same backend.
pub fn ip_only<BA>(
    backend: BA,
    config: Arc<RateLimitConfig>,
) -> RateLimiter<BA, SlidingWindowOutput, impl Fn(&ServiceRequest) -> InputFuture + 'static>
where
    BA: Backend<SlidingWindowInput, Output = SlidingWindowOutput> + 'static,
{
    let input = InputFunctionBuilder::new(config)
        .key_strategy(KeyStrategy::IpOnly)
        .key_prefix("ip_only")
        .build();
    RateLimiter::builder(backend, input).add_headers().build()
}

/// Limits authenticated users only; anonymous requests pass untouched.
///
/// Runs in addition to a [global] limiter, after the authentication middleware. Keys are
/// prefixed with `user_only`.
pub fn user_only<BA>(
    backend: BA,
    config: Arc<RateLimitConfig>,
) -> RateLimiter<BA, SlidingWindowOutput, impl Fn(&ServiceRequest) -> InputFuture + 'static>
where
    BA: Backend<SlidingWindowInput, Output = SlidingWindowOutput> + 'static,
{
    let input = InputFunctionBuilder::new(config)
        .key_strategy(KeyStrategy::UserOnly)
        .key_prefix("user_only")
        .build();
    RateLimiter::builder(backend, input).add_headers().build()
}
