//! Eagerly-started asynchronous resources with a synchronous read contract.
//!
//! A [`Resource`] wraps exactly one asynchronous operation. The operation is
//! spawned on the current Tokio runtime the moment the resource is created, and
//! its outcome is memoized: every later [`read`](Resource::read) observes the
//! same value or the same error.
//!
//! ## States
//!
//! | State                          | Meaning                                     |
//! |--------------------------------|---------------------------------------------|
//! | [`ResourceState::Pending`]     | the operation has not completed yet         |
//! | [`ResourceState::Resolved`]    | the operation succeeded; value is memoized  |
//! | [`ResourceState::Rejected`]    | the operation failed; error is replayed     |
//!
//! Transitions happen exactly once, from `Pending` to one of the terminal states.
//!
//! Callers choose how to wait: poll with [`Resource::read`], suspend with
//! [`Resource::settled`], or subscribe with [`Resource::on_settle`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

/// Type-erased, heap-allocated future produced by a [`Fetch`] implementation.
pub type FetchFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

/// The outbound data-layer seam: builds the operation behind a new [`Resource`].
///
/// Any `Fn(&str) -> impl Future<Output = Result<T, E>> + Send + 'static` that is
/// also `Send + Sync + 'static` implements this trait through the blanket impl
/// below, so plain async closures can be passed wherever a fetcher is expected.
///
/// The key handed to [`fetch`](Fetch::fetch) is always the normalized cache key.
pub trait Fetch<T, E>: Send + Sync + 'static {
    /// Starts a lookup for `key`.
    fn fetch(&self, key: &str) -> FetchFuture<T, E>;
}

impl<T, E, F, Fut> Fetch<T, E> for F
where
    F: Fn(&str) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    fn fetch(&self, key: &str) -> FetchFuture<T, E> {
        Box::pin((self)(key))
    }
}

/// Why a [`Resource`] could not hand out a value.
///
/// `Pending` is a control signal rather than a failure: the value is simply not
/// available yet.
#[derive(Debug, Error)]
pub enum ResourceError<E> {
    #[error("resource is still pending")]
    Pending,

    #[error("operation failed: {0}")]
    Failed(Arc<E>),

    #[error("operation was dropped before it settled")]
    Abandoned,
}

impl<E> ResourceError<E> {
    /// Returns `true` for the "not yet available" signal.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns the captured operation error, if this is a [`ResourceError::Failed`].
    pub fn cause(&self) -> Option<&Arc<E>> {
        match self {
            Self::Failed(cause) => Some(cause),
            _ => None,
        }
    }
}

impl<E> Clone for ResourceError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Pending => Self::Pending,
            Self::Failed(cause) => Self::Failed(Arc::clone(cause)),
            Self::Abandoned => Self::Abandoned,
        }
    }
}

/// Observable state of a [`Resource`].
pub enum ResourceState<T, E> {
    /// The operation is still running.
    Pending,
    /// The operation completed successfully.
    Resolved(Arc<T>),
    /// The operation failed, or was torn down before completing.
    Rejected(ResourceError<E>),
}

impl<T, E> ResourceState<T, E> {
    /// Returns `true` while the operation has not settled.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Converts the state into a `Result`, mapping `Pending` to [`ResourceError::Pending`].
    pub fn into_result(self) -> Result<Arc<T>, ResourceError<E>> {
        match self {
            Self::Pending => Err(ResourceError::Pending),
            Self::Resolved(value) => Ok(value),
            Self::Rejected(error) => Err(error),
        }
    }
}

// Manual impl: the payloads live behind `Arc`, so `T` and `E` need not be `Clone`.
impl<T, E> Clone for ResourceState<T, E> {
    fn clone(&self) -> Self {
        match self {
            Self::Pending => Self::Pending,
            Self::Resolved(value) => Self::Resolved(Arc::clone(value)),
            Self::Rejected(error) => Self::Rejected(error.clone()),
        }
    }
}

impl<T, E> fmt::Debug for ResourceState<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("Pending"),
            Self::Resolved(_) => f.write_str("Resolved(..)"),
            Self::Rejected(ResourceError::Abandoned) => f.write_str("Rejected(Abandoned)"),
            Self::Rejected(_) => f.write_str("Rejected(..)"),
        }
    }
}

/// Handle to a single eagerly-started asynchronous operation.
///
/// Cloning a `Resource` is cheap and yields another handle to the *same*
/// operation; use [`Resource::ptr_eq`] to compare identity.
///
/// # Examples
///
/// ```rust
/// use rescache::resource::{Resource, ResourceState};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let resource: Resource<u32, String> = Resource::new(async { Ok(42) });
///
/// assert_eq!(*resource.settled().await.unwrap(), 42);
/// assert!(matches!(resource.read(), ResourceState::Resolved(v) if *v == 42));
/// # }
/// ```
pub struct Resource<T, E> {
    state: watch::Receiver<ResourceState<T, E>>,
}

impl<T, E> Clone for Resource<T, E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Resource<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl<T, E> Resource<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Spawns `operation` and returns a handle to its eventual outcome.
    ///
    /// The operation starts running immediately and is executed exactly once.
    /// No retry is ever attempted; a new attempt needs a new `Resource`.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new<F>(operation: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(ResourceState::Pending);
        let guard = SettleGuard { tx };

        tokio::spawn(async move {
            let state = match operation.await {
                Ok(value) => ResourceState::Resolved(Arc::new(value)),
                Err(error) => ResourceState::Rejected(ResourceError::Failed(Arc::new(error))),
            };
            guard.tx.send_replace(state);
        });

        Self { state: rx }
    }

    /// Starts `fetcher` for `key` and wraps the lookup in a new resource.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn fetch<F>(fetcher: &F, key: &str) -> Self
    where
        F: Fetch<T, E> + ?Sized,
    {
        Self::new(fetcher.fetch(key))
    }

    /// Waits until the operation settles and returns its outcome.
    ///
    /// Never returns [`ResourceError::Pending`].
    pub async fn settled(&self) -> Result<Arc<T>, ResourceError<E>> {
        let mut rx = self.state.clone();
        match rx.wait_for(|state| !state.is_pending()).await {
            Ok(state) => state.clone().into_result(),
            // The guard always publishes a terminal state before the sender drops.
            Err(_) => Err(ResourceError::Abandoned),
        }
    }

    /// Runs `callback` once with the settled outcome.
    ///
    /// The callback is invoked from a spawned task; if the resource has already
    /// settled it runs on the next scheduling opportunity.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn on_settle<C>(&self, callback: C)
    where
        C: FnOnce(Result<Arc<T>, ResourceError<E>>) + Send + 'static,
    {
        let resource = self.clone();
        tokio::spawn(async move {
            callback(resource.settled().await);
        });
    }
}

impl<T, E> Resource<T, E> {
    /// Returns the current state without waiting.
    ///
    /// While pending this keeps returning [`ResourceState::Pending`]; once settled
    /// it returns the same `Arc`-shared value or error on every call.
    pub fn read(&self) -> ResourceState<T, E> {
        self.state.borrow().clone()
    }

    /// Like [`read`](Self::read), flattened into a `Result`.
    pub fn try_read(&self) -> Result<Arc<T>, ResourceError<E>> {
        self.read().into_result()
    }

    /// Returns `true` while the operation has not settled.
    pub fn is_pending(&self) -> bool {
        self.state.borrow().is_pending()
    }

    /// Returns `true` once the operation has resolved or rejected.
    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    /// Returns `true` if both handles refer to the same operation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.state.same_channel(&other.state)
    }
}

// Publishes `Abandoned` if the spawned operation is dropped (panic, runtime
// shutdown) before it could publish its own outcome.
struct SettleGuard<T, E> {
    tx: watch::Sender<ResourceState<T, E>>,
}

impl<T, E> Drop for SettleGuard<T, E> {
    fn drop(&mut self) {
        let abandoned = self.tx.send_if_modified(|state| {
            if state.is_pending() {
                *state = ResourceState::Rejected(ResourceError::Abandoned);
                true
            } else {
                false
            }
        });
        if abandoned {
            warn!("resource operation dropped before settling");
        }
    }
}
