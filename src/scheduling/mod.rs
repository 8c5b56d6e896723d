//! Scheduling integration — how a view layer requests and observes resources.
//!
//! This module provides the pieces a rendering layer needs on top of the cache:
//!
//! - [`TransitionConfig`] — the three tunables of a deferred (low-priority)
//!   request. The cache never reads them; only [`Transition`] does.
//! - [`Transition`] — one deferred request: waits for a resource for at most
//!   `timeout`, and decides when a "busy" indicator should be shown.
//! - [`ResourceSlot`] — the holder of "the resource currently on screen". An
//!   empty name clears the slot instead of creating a resource.
//!
//! Waiting never cancels an operation. A transition that times out only stops
//! waiting; the resource keeps running and stays cached.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::{Instant, timeout_at};
use tracing::debug;

use crate::cache::ResourceCache;
use crate::cache::config::millis;
use crate::resource::{Fetch, Resource, ResourceError};

/// Tunables for a deferred request, passed through unchanged to [`Transition`].
///
/// | Field               | Default  | Meaning                                            |
/// |---------------------|----------|----------------------------------------------------|
/// | `timeout`           | 4000 ms  | longest wait before the transition is forced       |
/// | `busy_delay`        | 300 ms   | wait before a busy indicator becomes visible       |
/// | `busy_min_duration` | 700 ms   | shortest time a shown busy indicator stays visible |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransitionConfig {
    #[serde(rename = "timeout_ms", deserialize_with = "millis")]
    pub timeout: Duration,

    #[serde(rename = "busy_delay_ms", deserialize_with = "millis")]
    pub busy_delay: Duration,

    #[serde(rename = "busy_min_duration_ms", deserialize_with = "millis")]
    pub busy_min_duration: Duration,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(4_000),
            busy_delay: Duration::from_millis(300),
            busy_min_duration: Duration::from_millis(700),
        }
    }
}

/// Result of waiting on a resource inside a [`Transition`].
#[derive(Debug)]
pub enum TransitionOutcome<T, E> {
    /// The resource settled before the transition timed out.
    Settled(Result<Arc<T>, ResourceError<E>>),
    /// The timeout elapsed first; the caller should show its fallback.
    TimedOut,
}

/// One deferred request, started when the caller switches to a new resource.
#[derive(Debug, Clone)]
pub struct Transition {
    config: TransitionConfig,
    started_at: Instant,
    busy_shown_at: Option<Instant>,
}

impl Transition {
    /// Starts a transition now.
    pub fn start(config: TransitionConfig) -> Self {
        Self {
            config,
            started_at: Instant::now(),
            busy_shown_at: None,
        }
    }

    /// Returns the tunables this transition runs with.
    pub fn config(&self) -> &TransitionConfig {
        &self.config
    }

    /// Instant the transition started.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Instant after which the transition is forced to complete.
    pub fn deadline(&self) -> Instant {
        self.started_at + self.config.timeout
    }

    /// Returns `true` once `now` has reached the deadline.
    pub fn is_timed_out(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// Waits for `resource` to settle, but no longer than the transition's deadline.
    pub async fn await_settled<T, E>(&self, resource: &Resource<T, E>) -> TransitionOutcome<T, E>
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        match timeout_at(self.deadline(), resource.settled()).await {
            Ok(outcome) => TransitionOutcome::Settled(outcome),
            Err(_) => {
                debug!(timeout = ?self.config.timeout, "transition timed out");
                TransitionOutcome::TimedOut
            }
        }
    }

    /// Decides whether the busy indicator should be visible at `now`.
    ///
    /// While `pending`, the indicator appears once `busy_delay` has elapsed.
    /// Once shown, it stays visible for at least `busy_min_duration`, even if the
    /// work finishes sooner.
    pub fn busy_visible(&mut self, now: Instant, pending: bool) -> bool {
        if let Some(shown_at) = self.busy_shown_at {
            if pending || now < shown_at + self.config.busy_min_duration {
                return true;
            }
            self.busy_shown_at = None;
            return false;
        }

        if pending && now >= self.started_at + self.config.busy_delay {
            self.busy_shown_at = Some(now);
            return true;
        }
        false
    }
}

/// Holder for the resource a view is currently showing.
///
/// Requests go through a shared [`ResourceCache`], so rapid successive requests
/// for the same name reuse one resource. Requesting an empty name releases the
/// held resource without creating a new one.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use rescache::ResourceCache;
/// use rescache::scheduling::{ResourceSlot, TransitionConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache = Arc::new(ResourceCache::<usize, String>::default());
/// let fetch = |name: &str| {
///     let len = name.len();
///     async move { Ok::<_, String>(len) }
/// };
/// let mut slot = ResourceSlot::new(cache, Arc::new(fetch), TransitionConfig::default());
///
/// assert!(slot.request("Pikachu").is_some());
/// assert!(slot.request("").is_none());
/// assert!(slot.current().is_none());
/// # }
/// ```
pub struct ResourceSlot<T, E> {
    cache: Arc<ResourceCache<T, E>>,
    fetcher: Arc<dyn Fetch<T, E>>,
    config: TransitionConfig,
    current: Option<Resource<T, E>>,
    transition: Option<Transition>,
}

impl<T, E> ResourceSlot<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates an empty slot backed by `cache`, creating misses with `fetcher`.
    pub fn new(
        cache: Arc<ResourceCache<T, E>>,
        fetcher: Arc<dyn Fetch<T, E>>,
        config: TransitionConfig,
    ) -> Self {
        Self {
            cache,
            fetcher,
            config,
            current: None,
            transition: None,
        }
    }

    /// Switches the slot to the resource for `name` and starts a new transition.
    ///
    /// An empty `name` clears the slot and returns `None`; no resource is created.
    pub fn request(&mut self, name: &str) -> Option<&Resource<T, E>> {
        if name.is_empty() {
            self.clear();
            return None;
        }

        let resource = self.cache.get_or_fetch(name, &*self.fetcher);
        self.transition = Some(Transition::start(self.config));
        self.current = Some(resource);
        self.current.as_ref()
    }

    /// Waits for the current resource within the current transition's deadline.
    ///
    /// Returns `None` when the slot is empty.
    pub async fn await_current(&self) -> Option<TransitionOutcome<T, E>> {
        let resource = self.current.as_ref()?;
        let transition = self.transition.as_ref()?;
        Some(transition.await_settled(resource).await)
    }
}

impl<T, E> ResourceSlot<T, E> {
    /// The resource currently held, if any.
    pub fn current(&self) -> Option<&Resource<T, E>> {
        self.current.as_ref()
    }

    /// The transition started by the latest non-empty request, if any.
    pub fn transition(&self) -> Option<&Transition> {
        self.transition.as_ref()
    }

    /// Mutable access to the latest transition, for busy-indicator bookkeeping.
    pub fn transition_mut(&mut self) -> Option<&mut Transition> {
        self.transition.as_mut()
    }

    /// Releases the held resource.
    pub fn clear(&mut self) {
        self.current = None;
        self.transition = None;
    }
}

impl<T, E> fmt::Debug for ResourceSlot<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSlot")
            .field("config", &self.config)
            .field("current", &self.current)
            .field("transition", &self.transition)
            .finish_non_exhaustive()
    }
}
