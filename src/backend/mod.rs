mod input_builder;

#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod memory;

#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod window;

pub use input_builder::{
    client_ip, Admission, AuthenticatedUser, Exemption, InputFunctionBuilder, InputFuture,
    KeyStrategy,
};
use std::future::Future;

use crate::HeaderCompatibleOutput;
use std::time::Duration;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed {
            Self::Allowed
        } else {
            Self::Denied
        }
    }

    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }
}

/// Describes an implementation of a rate limiting store and algorithm.
///
/// A Backend is required to implement [Clone], usually this means wrapping your data store within
/// an [Arc](std::sync::Arc).
pub trait Backend<I: 'static = SlidingWindowInput>: Clone {
    type Output;
    type RollbackToken;
    type Error;

    /// Process an incoming request.
    ///
    /// The input includes the rate limit key and the policy to be applied.
    ///
    /// Returns whether to allow or deny the request, output that can be used to transform the
    /// allowed and denied responses, and a token to allow the admission to be rolled back.
    fn request(
        &self,
        input: I,
    ) -> impl Future<Output = Result<(Decision, Self::Output, Self::RollbackToken), Self::Error>>;

    /// Undo an admission after the request has been handled.
    ///
    /// E.g. We may want to exclude 5xx errors from counting against a caller's quota,
    /// we can only exclude them after having already allowed the request through the rate limiter
    /// in the first place.
    ///
    /// # Arguments
    ///
    /// * `token`: The token returned from the initial call to [Backend::request()].
    fn rollback(&self, token: Self::RollbackToken)
        -> impl Future<Output = Result<(), Self::Error>>;
}

/// Input for a sliding window [Backend].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindowInput {
    /// The rate limit key to be used for this request, e.g. `ip:10.0.0.1` or `user:42`.
    pub key: String,
    /// Requests admitted within the window before burst capacity is used.
    pub limit: u64,
    /// The sliding window over which requests are counted.
    pub window: Duration,
    /// Additional requests admitted once `limit` is reached.
    pub burst: u64,
}

impl SlidingWindowInput {
    /// The hard ceiling of admitted requests within one window.
    pub fn ceiling(&self) -> u64 {
        self.limit.saturating_add(self.burst)
    }
}

/// Output from a sliding window [Backend].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindowOutput {
    /// Requests permitted within the window, burst excluded.
    pub limit: u64,
    /// Requests left under `limit` once this one is counted.
    pub remaining: u64,
    /// The sliding window over which requests are counted.
    pub window: Duration,
}

/// Additional functions for a [Backend] that uses [SlidingWindowInput] and
/// [SlidingWindowOutput].
pub trait SlidingWindowBackend: Backend<SlidingWindowInput, Output = SlidingWindowOutput> {
    /// Requests left under `limit` for a key, without counting a new one.
    fn remaining(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> impl Future<Output = Result<u64, Self::Error>>;

    /// Removes the window for a given rate limit key.
    fn remove_key(&self, key: &str) -> impl Future<Output = Result<(), Self::Error>>;
}

impl HeaderCompatibleOutput for SlidingWindowOutput {
    fn limit(&self) -> u64 {
        self.limit
    }

    fn remaining(&self) -> u64 {
        self.remaining
    }

    fn window(&self) -> Duration {
        self.window
    }
}
