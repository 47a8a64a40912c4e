//! Cancellation & timeout coordination.
//!
//! A [`CancelSignal`] folds the run's user token and a per-operation deadline
//! into one terminal stop signal. The first reason observed is latched, so a
//! signal that tripped on its deadline keeps reporting a timeout even if the
//! user cancels afterwards.

use crate::NodeError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Why a signal tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    User,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    user: CancellationToken,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    latched: Arc<OnceLock<CancelReason>>,
}

impl CancelSignal {
    /// Compose the user token with a deadline starting now.
    pub fn compose(user: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            user,
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
            latched: Arc::new(OnceLock::new()),
        }
    }

    /// A signal that only trips if its own token is cancelled.
    pub fn detached() -> Self {
        Self::compose(CancellationToken::new(), None)
    }

    pub fn user_token(&self) -> &CancellationToken {
        &self.user
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Time left before the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    fn latch(&self, reason: CancelReason) -> CancelReason {
        *self.latched.get_or_init(|| reason)
    }

    pub fn reason(&self) -> Option<CancelReason> {
        if let Some(reason) = self.latched.get() {
            return Some(*reason);
        }
        if self.user.is_cancelled() {
            return Some(self.latch(CancelReason::User));
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(self.latch(CancelReason::Timeout)),
            _ => None,
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.reason().is_some()
    }

    /// Fail immediately if already tripped.
    pub fn check(&self) -> Result<(), NodeError> {
        match self.reason() {
            Some(reason) => Err(self.error_for(reason)),
            None => Ok(()),
        }
    }

    pub fn error_for(&self, reason: CancelReason) -> NodeError {
        match reason {
            CancelReason::User => NodeError::Cancelled,
            CancelReason::Timeout => NodeError::Timeout {
                millis: self.timeout.map_or(0, |t| t.as_millis() as u64),
            },
        }
    }

    /// Resolves once the signal trips.
    pub async fn tripped(&self) -> CancelReason {
        if let Some(reason) = self.reason() {
            return reason;
        }
        let reason = match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.user.cancelled() => CancelReason::User,
                _ = sleep_until(deadline) => CancelReason::Timeout,
            },
            None => {
                self.user.cancelled().await;
                CancelReason::User
            }
        };
        self.latch(reason)
    }

    /// Run `fut` unless the signal trips first; the future is dropped on trip.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T, NodeError>
    where
        F: Future<Output = Result<T, NodeError>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            reason = self.tripped() => Err(self.error_for(reason)),
            out = fut => out,
        }
    }
}

/// Operation classes with distinct time allowances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Passthrough,
    Text,
    Image,
    Audio,
    Code,
    /// Waits on a person or an external event.
    Interactive,
    Pacing,
}

/// Per-class deadlines in milliseconds; `None` means no deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    pub passthrough_ms: Option<u64>,
    pub text_ms: Option<u64>,
    pub image_ms: Option<u64>,
    pub audio_ms: Option<u64>,
    pub code_ms: Option<u64>,
    pub interactive_ms: Option<u64>,
    pub pacing_ms: Option<u64>,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            passthrough_ms: None,
            text_ms: Some(60_000),
            image_ms: Some(180_000),
            audio_ms: Some(180_000),
            code_ms: Some(15_000),
            interactive_ms: None,
            pacing_ms: None,
        }
    }
}

impl TimeoutPolicy {
    pub fn timeout_for(&self, class: OperationClass) -> Option<Duration> {
        let ms = match class {
            OperationClass::Passthrough => self.passthrough_ms,
            OperationClass::Text => self.text_ms,
            OperationClass::Image => self.image_ms,
            OperationClass::Audio => self.audio_ms,
            OperationClass::Code => self.code_ms,
            OperationClass::Interactive => self.interactive_ms,
            OperationClass::Pacing => self.pacing_ms,
        };
        ms.map(Duration::from_millis)
    }

    /// Same allowance for every class that has one; handy in tests.
    pub fn uniform(ms: u64) -> Self {
        Self {
            passthrough_ms: None,
            text_ms: Some(ms),
            image_ms: Some(ms),
            audio_ms: Some(ms),
            code_ms: Some(ms),
            interactive_ms: None,
            pacing_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_gets_longer_allowance_than_text() {
        let policy = TimeoutPolicy::default();
        assert!(policy.timeout_for(OperationClass::Image) > policy.timeout_for(OperationClass::Text));
        assert_eq!(policy.timeout_for(OperationClass::Passthrough), None);
    }

    #[tokio::test]
    async fn check_fails_fast_once_user_cancels() {
        let token = CancellationToken::new();
        let signal = CancelSignal::compose(token.clone(), None);
        assert!(signal.check().is_ok());
        token.cancel();
        assert_eq!(signal.check(), Err(NodeError::Cancelled));
    }
}
