#![cfg_attr(docsrs, feature(doc_cfg))]
//! Sliding window admission control for actix-web.
//!
//! ```no_run
//! use actix_sliding_rate_limit::backend::memory::InMemoryBackend;
//! use actix_sliding_rate_limit::policy::{EndpointOverride, Policy, RateLimitConfig};
//! use actix_sliding_rate_limit::presets;
//! use actix_web::{web, App, HttpServer};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let minute = Duration::from_secs(60);
//!     let config = Arc::new(
//!         RateLimitConfig::new(Policy::new(100, minute).with_burst(20))
//!             .endpoint(EndpointOverride::new("/auth/login", Policy::new(5, minute))),
//!     );
//!     let backend = InMemoryBackend::builder().with_config(&config).build();
//!     HttpServer::new(move || {
//!         App::new()
//!             .wrap(presets::global(backend.clone(), config.clone()))
//!             .route("/", web::get().to(|| async { "Hello world!" }))
//!     })
//!     .bind(("127.0.0.1", 8080))?
//!     .run()
//!     .await
//! }
//! ```

pub mod backend;
mod middleware;
pub mod policy;

pub use middleware::builder::{
    format_window, DeniedBody, HeaderCompatibleOutput, RateLimiterBuilder,
};
pub use middleware::presets;
pub use middleware::RateLimiter;
