//! Per-request context.
//!
//! A [`RequestContext`] is created by the correlation middleware and handed
//! explicitly to every collaborator that performs I/O on behalf of the
//! request. It carries the correlation ID, the deadline, a cancellation
//! token, the authenticated identity and a tracing span bound to the ID.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, Result};
use crate::id::RequestId;

/// Authenticated caller, as established by the auth middleware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Identity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            roles: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: RequestId,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    identity: Option<Arc<Identity>>,
    span: tracing::Span,
}

impl RequestContext {
    /// Context for a new request. The span is bound to the correlation ID.
    pub fn new(request_id: RequestId) -> Self {
        let span = tracing::info_span!("request", request_id = %request_id);
        Self {
            request_id,
            deadline: None,
            cancel: CancellationToken::new(),
            identity: None,
            span,
        }
    }

    /// Context for work that is not tied to an incoming request
    /// (startup checks, background collectors).
    pub fn background() -> Self {
        Self::new(RequestId::mint())
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(Arc::new(identity));
        self
    }

    /// Attach an absolute deadline, keeping an earlier one if present.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context whose deadline is at most `timeout` from now.
    ///
    /// Cancelling the parent cancels the child; cancelling the child leaves
    /// the parent untouched.
    pub fn child(&self, timeout: Duration) -> Self {
        let child = Self {
            request_id: self.request_id.clone(),
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
            identity: self.identity.clone(),
            span: self.span.clone(),
        };
        child.with_timeout(timeout)
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Fail with `Timeout` when the context is cancelled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() || self.is_expired() {
            return Err(CoreError::Timeout);
        }
        Ok(())
    }

    /// Run `fut` until it completes, the deadline passes, or the context is
    /// cancelled, whichever comes first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CoreError::Timeout),
            _ = sleep_until(self.deadline) => Err(CoreError::Timeout),
            out = fut => Ok(out),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
