//! Single-flight, expiring async values.
//!
//! An [`Expiring`] holds at most one fetch at a time. The fetch runs as its
//! own task so callers that give up waiting do not cancel it, and every
//! concurrent caller observes the same result. A new fetch is started only
//! when the current one is stale; starting one aborts its predecessor.

use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::error::{Error, Result};

type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

/// When a completed fetch stops being reusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Reuse a successful result until it is older than the given age.
    After(Duration),
    /// Reuse a successful result forever.
    Never,
    /// Never reuse a completed result; only coalesce callers while in flight.
    OnCompletion,
}

struct Slot<T> {
    started: Instant,
    result: SharedResult<T>,
    abort: AbortHandle,
    /// Set by `invalidate`; honored once the fetch completes.
    stale: bool,
}

pub struct Expiring<T> {
    expiry: Expiry,
    slot: Mutex<Option<Slot<T>>>,
}

impl<T> Expiring<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(expiry: Expiry) -> Self {
        Self {
            expiry,
            slot: Mutex::new(None),
        }
    }

    /// Returns the current value, starting a fetch if it is stale.
    ///
    /// A caller whose fetch is aborted by a concurrent restart re-checks and
    /// waits on (or starts) the replacement instead of failing.
    pub async fn get<F>(&self, fetch: F) -> Result<T>
    where
        F: Fn() -> BoxFuture<'static, Result<T>>,
    {
        loop {
            let pending = {
                let mut slot = self.slot.lock();
                match slot.as_ref() {
                    Some(current) if !self.is_stale(current) => current.result.clone(),
                    _ => {
                        let (next, result) = Self::start(fetch());
                        if let Some(previous) = slot.replace(next) {
                            previous.abort.abort();
                        }
                        result
                    }
                }
            };

            match pending.await {
                Err(Error::Cancelled) => continue,
                result => return result,
            }
        }
    }

    /// Starts a new fetch regardless of staleness and waits for it.
    pub async fn refresh<F>(&self, fetch: F) -> Result<T>
    where
        F: Fn() -> BoxFuture<'static, Result<T>>,
    {
        let pending = self.restart(fetch());
        match pending.await {
            Err(Error::Cancelled) => self.get(fetch).await,
            result => result,
        }
    }

    /// Marks the held value stale without interrupting a fetch in flight.
    ///
    /// Callers already waiting keep the in-flight result; the first `get`
    /// after it completes starts a new fetch.
    pub fn invalidate(&self) {
        if let Some(slot) = self.slot.lock().as_mut() {
            slot.stale = true;
        }
    }

    /// Aborts any fetch in flight and forgets the held value.
    pub fn cancel(&self) {
        if let Some(slot) = self.slot.lock().take() {
            slot.abort.abort();
        }
    }

    /// Returns the last successful value if it has already been observed.
    pub fn peek(&self) -> Option<T> {
        let slot = self.slot.lock();
        let slot = slot.as_ref().filter(|slot| !slot.stale)?;
        match slot.result.peek()? {
            Ok(value) => Some(value.clone()),
            Err(_) => None,
        }
    }

    fn restart(&self, fetch: BoxFuture<'static, Result<T>>) -> SharedResult<T> {
        let (next, result) = Self::start(fetch);
        if let Some(previous) = self.slot.lock().replace(next) {
            previous.abort.abort();
        }
        result
    }

    fn start(fetch: BoxFuture<'static, Result<T>>) -> (Slot<T>, SharedResult<T>) {
        let handle = tokio::spawn(fetch);
        let abort = handle.abort_handle();
        let result = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(Error::Cancelled),
                Err(e) => Err(Error::Task(e.to_string())),
            }
        }
        .boxed()
        .shared();

        let slot = Slot {
            started: Instant::now(),
            result: result.clone(),
            abort,
            stale: false,
        };
        (slot, result)
    }

    fn is_stale(&self, slot: &Slot<T>) -> bool {
        match slot.result.peek() {
            // Still running: never restart underneath the waiters.
            None => false,
            Some(Err(_)) => true,
            Some(Ok(_)) if slot.stale => true,
            Some(Ok(_)) => match self.expiry {
                Expiry::After(ttl) => slot.started.elapsed() > ttl,
                Expiry::Never => false,
                Expiry::OnCompletion => true,
            },
        }
    }
}
