pub(crate) mod whitelist;

pub use whitelist::{Whitelist, WhitelistEntry};

use serde::{Deserialize, Deserializer};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Longest window a policy may use, one week.
pub const MAX_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid whitelist entry {entry:?}: {reason}")]
    InvalidWhitelistEntry { entry: String, reason: String },
    #[error("The rate limit window must be non-zero")]
    ZeroWindow,
    #[error("The rate limit window for endpoint {0:?} must be non-zero")]
    ZeroEndpointWindow(String),
    #[error("The rate limit window of {0}s exceeds {}s", MAX_WINDOW_SECS)]
    WindowTooLong(u64),
    #[error("The rate limit window for endpoint {0:?} of {1}s exceeds {}s", MAX_WINDOW_SECS)]
    EndpointWindowTooLong(String, u64),
    #[error("Endpoint overrides require a non-empty path")]
    EmptyEndpointPath,
}

/// A quota applied to each caller key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Policy {
    /// Requests admitted within the window before burst capacity is used.
    pub limit: u64,
    /// The sliding window over which requests are counted, given in seconds when deserialized.
    #[serde(rename = "window_secs", deserialize_with = "deserialize_secs")]
    pub window: Duration,
    /// Extra requests admitted once `limit` is reached, inside the same window.
    #[serde(default)]
    pub burst: u64,
}

impl Policy {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            burst: 0,
        }
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    /// The hard ceiling of admitted requests within one window.
    pub fn ceiling(&self) -> u64 {
        self.limit.saturating_add(self.burst)
    }
}

/// How an [EndpointOverride] path is compared with the request path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMatch {
    /// The request path equals the override path, or continues it after a `/`.
    ///
    /// `/user` matches `/user` and `/user/42` but not `/users`.
    #[default]
    Segment,
    /// The override path appears anywhere within the request path.
    ///
    /// `/user` matches `/users/demos` and `/api/user`.
    Substring,
}

impl PathMatch {
    pub fn matches(self, pattern: &str, path: &str) -> bool {
        match self {
            PathMatch::Segment => match path.strip_prefix(pattern) {
                Some(rest) => rest.is_empty() || rest.starts_with('/') || pattern.ends_with('/'),
                None => false,
            },
            PathMatch::Substring => path.contains(pattern),
        }
    }
}

/// A policy that supersedes the global one for matching request paths.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointOverride {
    pub path: String,
    #[serde(default, rename = "match")]
    pub matching: PathMatch,
    #[serde(flatten)]
    pub policy: Policy,
}

impl EndpointOverride {
    pub fn new(path: impl Into<String>, policy: Policy) -> Self {
        Self {
            path: path.into(),
            matching: PathMatch::default(),
            policy,
        }
    }

    pub fn matching(mut self, matching: PathMatch) -> Self {
        self.matching = matching;
        self
    }

    pub fn matches(&self, path: &str) -> bool {
        self.matching.matches(&self.path, path)
    }
}

/// The policy chosen for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPolicy<'a> {
    pub policy: &'a Policy,
    /// The override path when an endpoint override was selected.
    pub endpoint: Option<&'a str>,
}

/// Static configuration of the admission control layer.
///
/// Usually deserialized from the application's configuration file, e.g.
///
/// ```json
/// {
///     "limit": 100,
///     "window_secs": 60,
///     "burst": 20,
///     "whitelist": ["127.0.0.1", "10.0.0.0/8"],
///     "user_based": true,
///     "endpoints": [
///         { "path": "/auth/login", "limit": 5, "window_secs": 60 }
///     ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    /// When false every request is admitted without being counted.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub policy: Policy,
    #[serde(default)]
    pub whitelist: Whitelist,
    /// Partition by the authenticated user when one is present, rather than by IP.
    #[serde(default)]
    pub user_based: bool,
    /// Key every IPv6 client of the same /64 together.
    #[serde(default)]
    pub group_ipv6_subnets: bool,
    /// Checked in order, the first match wins.
    #[serde(default)]
    pub endpoints: Vec<EndpointOverride>,
}

fn default_enabled() -> bool {
    true
}

fn deserialize_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

impl RateLimitConfig {
    pub fn new(policy: Policy) -> Self {
        Self {
            enabled: true,
            policy,
            whitelist: Whitelist::default(),
            user_based: false,
            group_ipv6_subnets: false,
            endpoints: Vec::new(),
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn whitelist(mut self, whitelist: Whitelist) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn user_based(mut self, user_based: bool) -> Self {
        self.user_based = user_based;
        self
    }

    pub fn group_ipv6_subnets(mut self, group: bool) -> Self {
        self.group_ipv6_subnets = group;
        self
    }

    pub fn endpoint(mut self, endpoint: EndpointOverride) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Check the values that would otherwise make every request behave oddly.
    ///
    /// A zero `limit` is accepted, it denies everything that isn't whitelisted. Windows must
    /// lie within `(0, MAX_WINDOW_SECS]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let window = self.policy.window;
        if window.is_zero() {
            return Err(ConfigError::ZeroWindow);
        }
        if window.as_secs() > MAX_WINDOW_SECS {
            return Err(ConfigError::WindowTooLong(window.as_secs()));
        }
        for endpoint in &self.endpoints {
            if endpoint.path.is_empty() {
                return Err(ConfigError::EmptyEndpointPath);
            }
            let window = endpoint.policy.window;
            if window.is_zero() {
                return Err(ConfigError::ZeroEndpointWindow(endpoint.path.clone()));
            }
            if window.as_secs() > MAX_WINDOW_SECS {
                return Err(ConfigError::EndpointWindowTooLong(
                    endpoint.path.clone(),
                    window.as_secs(),
                ));
            }
        }
        Ok(())
    }

    /// Select the policy for a request path, falling back to the global policy.
    pub fn resolve(&self, path: &str) -> ResolvedPolicy<'_> {
        self.endpoints
            .iter()
            .find(|endpoint| endpoint.matches(path))
            .map(|endpoint| ResolvedPolicy {
                policy: &endpoint.policy,
                endpoint: Some(endpoint.path.as_str()),
            })
            .unwrap_or(ResolvedPolicy {
                policy: &self.policy,
                endpoint: None,
            })
    }

    /// Whether a client bypasses limiting. Always true while the layer is disabled.
    pub fn is_whitelisted(&self, ip: Option<IpAddr>) -> bool {
        if !self.enabled {
            return true;
        }
        ip.is_some_and(|ip| self.whitelist.contains(ip))
    }
}
