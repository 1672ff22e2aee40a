//! Caller-supplied cancellation and deadlines for coordinator calls.
//!
//! A [`Context`] pairs a cancellation token with an optional deadline. Every client
//! operation takes one; [`Context::run`] races the request future against both and
//! drops the request as soon as either fires. Tokens form a tree: cancelling a
//! parent cancels every child derived from it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Reasons for request cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// Explicit caller cancellation
    #[default]
    UserRequested,
    /// Deadline expired before the response arrived
    DeadlineExceeded,
    /// The connection the call was using has been released
    ConnectionClosed,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            CancelReason::ConnectionClosed => write!(f, "ConnectionClosed"),
        }
    }
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
    children: Mutex<Vec<Weak<CancelState>>>,
}

impl CancelState {
    fn cancel(&self, reason: CancelReason) {
        if let Ok(mut r) = self.reason.lock() {
            if r.is_none() {
                *r = Some(reason);
            }
        }
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();
        let children = match self.children.lock() {
            Ok(mut c) => std::mem::take(&mut *c),
            Err(_) => return,
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(reason);
        }
    }

    fn reason(&self) -> Option<CancelReason> {
        self.reason.lock().ok().and_then(|r| *r)
    }
}

/// A lightweight, cloneable cancellation token.
/// Multiple recipients can wait for cancellation.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    /// Check if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Get the cancellation reason if cancelled.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        if self.is_cancelled() {
            self.state.reason()
        } else {
            None
        }
    }

    /// Completes once the token is cancelled, yielding the reason.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return self.state.reason().unwrap_or_default();
            }
            notified.await;
        }
    }

    /// Create a child token that is cancelled when the parent is cancelled,
    /// but can also be cancelled independently.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let state = Arc::new(CancelState::default());
        let mut inherited = None;
        match self.state.children.lock() {
            Ok(mut children) => {
                children.retain(|c| c.strong_count() > 0);
                children.push(Arc::downgrade(&state));
                // checked under the lock so a concurrent cancel either sees
                // the child or is observed here
                if self.is_cancelled() {
                    inherited = Some(self.state.reason().unwrap_or_default());
                }
            }
            Err(_) => inherited = Some(self.state.reason().unwrap_or_default()),
        }
        if let Some(reason) = inherited {
            state.cancel(reason);
        }
        (
            CancelToken {
                state: state.clone(),
            },
            CancelHandle { state },
        )
    }
}

/// The handle that triggers cancellation.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelHandle {
    /// Trigger cancellation with the given reason. Later calls keep the first reason.
    pub fn cancel(&self, reason: CancelReason) {
        self.state.cancel(reason);
    }

    /// Check if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

/// Create a new cancellation token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let state = Arc::new(CancelState::default());
    (
        CancelToken {
            state: state.clone(),
        },
        CancelHandle { state },
    )
}

/// Absolute point in time after which a call is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Creates a new deadline from now + timeout.
    pub fn new(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    /// Creates a deadline at the given instant.
    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    /// Returns the remaining time, or `None` if the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        if self.at > now {
            Some(self.at - now)
        } else {
            None
        }
    }

    /// Returns `true` if the deadline has expired.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }

    /// The instant the deadline expires at.
    pub fn instant(&self) -> Instant {
        self.at
    }
}

/// Cancellation scope and deadline for a single operation.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancelToken,
    deadline: Option<Deadline>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        let (token, _handle) = new_cancel_pair();
        Self {
            token,
            deadline: None,
        }
    }

    /// A cancellable context and the handle that cancels it.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (token, handle) = new_cancel_pair();
        (
            Self {
                token,
                deadline: None,
            },
            handle,
        )
    }

    /// A context expiring `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    /// A context expiring at `deadline`.
    pub fn with_deadline(deadline: Deadline) -> Self {
        Self::background().deadline_at(deadline)
    }

    /// Derives a context that is cancelled with this one but can be cancelled alone.
    pub fn child(&self) -> (Self, CancelHandle) {
        let (token, handle) = self.token.child();
        (
            Self {
                token,
                deadline: self.deadline,
            },
            handle,
        )
    }

    /// Same context with its deadline moved to at most `timeout` from now.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline_at(Deadline::new(timeout))
    }

    /// Same context with its deadline moved to at most `deadline`. A deadline is
    /// only ever tightened.
    pub fn deadline_at(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// The deadline, if one is set.
    pub fn deadline(&self) -> Option<&Deadline> {
        self.deadline.as_ref()
    }

    /// The cancellation token of this context.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Returns an error if the context is already cancelled or past its deadline.
    pub fn check(&self) -> Result<(), CancelReason> {
        if let Some(reason) = self.token.cancelled_reason() {
            return Err(reason);
        }
        if self.deadline.is_some_and(|d| d.is_expired()) {
            return Err(CancelReason::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drives `fut` until it completes, the context is cancelled, or the deadline passes.
    ///
    /// On cancellation `fut` is dropped without being polled again.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, CancelReason> {
        self.check()?;
        let expiry = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d.instant()).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            reason = self.token.cancelled() => Err(reason),
            _ = expiry => Err(CancelReason::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}
