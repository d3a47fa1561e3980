use crate::backend::window::WindowStore;
use crate::backend::{
    Backend, Decision, SlidingWindowBackend, SlidingWindowInput, SlidingWindowOutput,
};
use crate::policy::RateLimitConfig;
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use std::convert::Infallible;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60;

/// A sliding window rate limiter [Backend] that keeps every caller's recent admission times in
/// memory.
///
/// A caller is admitted while fewer than `limit + burst` of its requests fall within the
/// window. Counters are local to the process.
#[derive(Clone)]
pub struct InMemoryBackend {
    store: Arc<WindowStore>,
    reclaimer: Option<Arc<Reclaimer>>,
}

// Shared by every clone of the backend, the task is aborted when the last one is dropped.
struct Reclaimer {
    handle: JoinHandle<()>,
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Identifies a single admission so that it can be rolled back.
#[derive(Debug, Clone)]
pub struct Admitted {
    key: String,
    at: Instant,
}

impl InMemoryBackend {
    pub fn builder() -> InMemoryBackendBuilder {
        InMemoryBackendBuilder {
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
            shutdown: None,
        }
    }

    /// Whether the background reclaimer is still sweeping.
    pub fn is_reclaiming(&self) -> bool {
        self.reclaimer
            .as_ref()
            .is_some_and(|reclaimer| !reclaimer.handle.is_finished())
    }

    fn reclaimer(
        store: Arc<WindowStore>,
        interval: Duration,
        shutdown: Option<LocalBoxFuture<'static, ()>>,
    ) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "GC interval must be non-zero"
        );
        actix_web::rt::spawn(async move {
            let mut shutdown = shutdown.unwrap_or_else(|| futures::future::pending().boxed_local());
            loop {
                let now = Instant::now();
                sweep_isolated(|| store.sweep(now));
                // Past the clock's range there is no next pass, only shutdown.
                let next_pass = match now.checked_add(interval) {
                    Some(deadline) => actix_web::rt::time::sleep_until(deadline).boxed_local(),
                    None => futures::future::pending().boxed_local(),
                };
                tokio::select! {
                    _ = &mut shutdown => {
                        log::debug!("Rate limit reclaimer shutting down");
                        break;
                    }
                    _ = next_pass => {}
                }
            }
        })
    }
}

/// Runs one sweep, logging rather than propagating a panic. Returns whether it completed.
fn sweep_isolated<F: FnOnce() -> usize>(sweep: F) -> bool {
    match catch_unwind(AssertUnwindSafe(sweep)) {
        Ok(removed) => {
            log::trace!("Removed {removed} idle rate limit windows");
            true
        }
        Err(_) => {
            log::error!("Rate limit window sweep panicked, will retry");
            false
        }
    }
}

impl Backend<SlidingWindowInput> for InMemoryBackend {
    type Output = SlidingWindowOutput;
    type RollbackToken = Admitted;
    type Error = Infallible;

    async fn request(
        &self,
        input: SlidingWindowInput,
    ) -> Result<(Decision, Self::Output, Self::RollbackToken), Self::Error> {
        let now = Instant::now();
        let ceiling = input.ceiling();
        let (decision, remaining) = self.store.upsert(&input.key, input.window, |window| {
            let decision = window.admit(now, input.window, ceiling);
            (decision, window.remaining(now, input.window, input.limit))
        });
        let output = SlidingWindowOutput {
            limit: input.limit,
            remaining,
            window: input.window,
        };
        Ok((
            decision,
            output,
            Admitted {
                key: input.key,
                at: now,
            },
        ))
    }

    async fn rollback(&self, token: Self::RollbackToken) -> Result<(), Self::Error> {
        self.store
            .update(&token.key, |window| window.forget(token.at));
        Ok(())
    }
}

impl SlidingWindowBackend for InMemoryBackend {
    async fn remaining(&self, key: &str, limit: u64, window: Duration) -> Result<u64, Self::Error> {
        let now = Instant::now();
        Ok(self
            .store
            .get(key, |caller| caller.remaining(now, window, limit))
            .unwrap_or(limit))
    }

    async fn remove_key(&self, key: &str) -> Result<(), Self::Error> {
        self.store.delete(key);
        Ok(())
    }
}

pub struct InMemoryBackendBuilder {
    gc_interval: Option<Duration>,
    shutdown: Option<LocalBoxFuture<'static, ()>>,
}

impl InMemoryBackendBuilder {
    /// Override the default reclaimer interval.
    ///
    /// Set to None to disable reclamation.
    ///
    /// The reclaimer periodically scans the store, removing callers with no requests left
    /// inside their window.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Reclaim once per global window of the config.
    pub fn with_config(mut self, config: &RateLimitConfig) -> Self {
        self.gc_interval = Some(config.policy.window).filter(|window| !window.is_zero());
        self
    }

    /// Stop the reclaimer when `signal` resolves, e.g. on server shutdown.
    ///
    /// The reclaimer is otherwise stopped when the last clone of the backend is dropped.
    pub fn with_shutdown<F>(mut self, signal: F) -> Self
    where
        F: Future<Output = ()> + 'static,
    {
        self.shutdown = Some(signal.boxed_local());
        self
    }

    pub fn build(self) -> InMemoryBackend {
        let store = Arc::new(WindowStore::new());
        let reclaimer = self.gc_interval.map(|gc_interval| {
            Arc::new(Reclaimer {
                handle: InMemoryBackend::reclaimer(store.clone(), gc_interval, self.shutdown),
            })
        });
        InMemoryBackend { store, reclaimer }
    }
}
