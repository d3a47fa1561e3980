use crate::backend::SlidingWindowInput;
use crate::policy::whitelist::canonical;
use crate::policy::RateLimitConfig;
use actix_web::dev::ServiceRequest;
use actix_web::HttpMessage;
use std::future::{ready, Ready};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

/// Client address headers, in order of precedence, consulted before the peer address.
pub const CLIENT_IP_HEADERS: [&str; 3] = ["x-forwarded-for", "x-real-ip", "cf-connecting-ip"];

/// The authenticated caller of a request.
///
/// Authentication middleware inserts this into the request extensions; the rate limiter only
/// reads it. A request without one is anonymous and keyed by IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Why a request was let through without being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exemption {
    /// Rate limiting is turned off in the config.
    Disabled,
    /// The client address is on the whitelist.
    Whitelisted,
    /// A user keyed limiter saw no authenticated user.
    Anonymous,
}

/// The outcome of an input function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission<I> {
    /// Check the request against the backend.
    Evaluate(I),
    /// Let the request through without consulting the backend.
    Exempt(Exemption),
}

/// How the caller part of a rate limit key is derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyStrategy {
    /// The authenticated user when the config is user based and one is present,
    /// otherwise the client IP.
    #[default]
    Auto,
    /// Always the client IP, for routes hit before authentication such as a login form.
    IpOnly,
    /// Always the authenticated user. Anonymous requests are not limited.
    UserOnly,
}

pub type InputFuture = Ready<Result<Admission<SlidingWindowInput>, actix_web::Error>>;

/// Creates the input function for a [RateLimiter](crate::RateLimiter) from a
/// [RateLimitConfig].
///
/// For every request the function decides, in order:
///
/// 1. whether the layer is disabled, or the client is whitelisted,
/// 2. the caller key, according to the [KeyStrategy],
/// 3. the policy, from the first endpoint override matching the path or else the global one.
///
/// Endpoint overrides count into their own window; the key is suffixed with `@` and the
/// override path, e.g. `ip:10.0.0.1@/auth/login`.
///
/// You should take care to ensure that limiters sharing a backend use distinct
/// [key prefixes](InputFunctionBuilder::key_prefix), otherwise a request is counted once by
/// each of them.
pub struct InputFunctionBuilder {
    config: Arc<RateLimitConfig>,
    strategy: KeyStrategy,
    key_prefix: Option<String>,
}

impl InputFunctionBuilder {
    pub fn new(config: Arc<RateLimitConfig>) -> Self {
        Self {
            config,
            strategy: KeyStrategy::default(),
            key_prefix: None,
        }
    }

    pub fn key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Namespace every key produced, e.g. `login` produces `login:ip:10.0.0.1`.
    pub fn key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = Some(prefix.to_owned());
        self
    }

    pub fn build(self) -> impl Fn(&ServiceRequest) -> InputFuture + 'static {
        move |req| ready(Ok(self.admission(req)))
    }

    fn admission(&self, req: &ServiceRequest) -> Admission<SlidingWindowInput> {
        let config = &self.config;
        if !config.enabled {
            return Admission::Exempt(Exemption::Disabled);
        }
        let ip = client_ip(req);
        if config.is_whitelisted(ip) {
            return Admission::Exempt(Exemption::Whitelisted);
        }
        let caller = match self.strategy {
            KeyStrategy::Auto if config.user_based => match authenticated_user(req) {
                Some(user) => user_key(&user),
                None => ip_key(ip, config.group_ipv6_subnets),
            },
            KeyStrategy::Auto | KeyStrategy::IpOnly => ip_key(ip, config.group_ipv6_subnets),
            KeyStrategy::UserOnly => match authenticated_user(req) {
                Some(user) => user_key(&user),
                None => return Admission::Exempt(Exemption::Anonymous),
            },
        };
        let resolved = config.resolve(req.path());
        let mut key = match &self.key_prefix {
            Some(prefix) => format!("{prefix}:{caller}"),
            None => caller,
        };
        if let Some(endpoint) = resolved.endpoint {
            key.push('@');
            key.push_str(endpoint);
        }
        Admission::Evaluate(SlidingWindowInput {
            key,
            limit: resolved.policy.limit,
            window: resolved.policy.window,
            burst: resolved.policy.burst,
        })
    }
}

/// Resolves the client address of a request.
///
/// The first of `X-Forwarded-For` (first entry), `X-Real-IP`, `CF-Connecting-IP` holding a
/// valid address wins, falling back to the connection peer address.
///
/// # Security
///
/// These headers are set by the client unless a proxy you control overwrites them, so this is
/// only suitable for applications deployed behind such a proxy.
pub fn client_ip(req: &ServiceRequest) -> Option<IpAddr> {
    CLIENT_IP_HEADERS
        .iter()
        .filter_map(|name| req.headers().get(*name))
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| parse_ip(value.split(',').next().unwrap_or(value)))
        .or_else(|| req.peer_addr().map(|addr| addr.ip()))
        .map(canonical)
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    let value = value.trim();
    value
        .parse::<IpAddr>()
        .ok()
        .or_else(|| value.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

fn authenticated_user(req: &ServiceRequest) -> Option<String> {
    req.extensions()
        .get::<AuthenticatedUser>()
        .filter(|user| !user.0.is_empty())
        .map(|user| user.0.clone())
}

fn user_key(user: &str) -> String {
    format!("user:{user}")
}

fn ip_key(ip: Option<IpAddr>, group_ipv6_subnets: bool) -> String {
    match ip {
        None => "ip:unknown".to_owned(),
        Some(IpAddr::V6(v6)) if group_ipv6_subnets => format!("ip:{}", ipv6_subnet(v6)),
        Some(ip) => format!("ip:{ip}"),
    }
}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
fn ipv6_subnet(v6: Ipv6Addr) -> String {
    let s = v6.segments();
    let subnet = Ipv6Addr::new(s[0], s[1], s[2], s[3], 0, 0, 0, 0);
    format!("{}/64", subnet)
}
