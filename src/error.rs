//! Error types for gateway operations.
//!
//! All errors implement the standard [`std::error::Error`] trait via
//! [`thiserror::Error`]. Variants are domain kinds, not transport details:
//! transient faults are retried inside the dispatch engine and never surface
//! here directly; callers only see an error once retries and polling are
//! exhausted or the provider signals a non-retryable outcome.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that can occur while talking to the payment gateway or while
/// reconciling its answers into the local ledger.
///
/// # Error Recovery
///
/// - [`Http`](Self::Http) and [`DeadlineExceeded`](Self::DeadlineExceeded)
///   are only returned after the internal retry/poll budget is spent.
/// - [`Authorization`](Self::Authorization) means the cached delegation token
///   is missing, unverified, or revoked; re-run the token exchange before
///   retrying.
/// - [`RecordingFailed`](Self::RecordingFailed) is special: the remote
///   payment **succeeded** but the local ledger write did not. Money moved;
///   only bookkeeping needs repair. Never treat it as a failed payment.
#[must_use = "errors should be handled, propagated, or explicitly panicked"]
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The resolved authorization is missing, expired, or not yet verified.
    #[error("authorization is missing, expired, or not yet verified")]
    Authorization,

    /// The buyer's scan code was invalid or expired.
    #[error("payment auth code is invalid or expired")]
    AuthCodeInvalid,

    /// No trade matched the given order identifiers.
    #[error("no trade found for the given order identifiers")]
    TradeNotFound,

    /// The trade exists but its status forbids the requested operation.
    #[error("trade status conflict: {0}")]
    TradeStatusConflict(String),

    /// The seller account balance cannot cover the operation.
    #[error("seller balance is insufficient")]
    BalanceInsufficient,

    /// The requested refund would exceed the refundable balance of the trade.
    #[error("refund amount exceeds the refundable balance of the trade")]
    RefundAmount,

    /// The provider rejected the call with a code the static table does not
    /// map to a more specific kind.
    #[error("provider rejected the request: {code}{sub_code}")]
    Provider {
        /// Top-level provider response code.
        code: String,
        /// Provider sub-code, empty when absent.
        sub_code: String,
    },

    /// The per-operation deadline elapsed before a terminal outcome.
    #[error("operation deadline exceeded after {elapsed:?}")]
    DeadlineExceeded {
        /// Wall time spent on the logical operation, retries included.
        elapsed: Duration,
    },

    /// HTTP request failed at the transport level.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider response could not be interpreted (malformed JSON,
    /// missing envelope key, missing response code).
    #[error("malformed provider response: {0}")]
    Protocol(String),

    /// Request signing failed. Fatal to the enclosing call, never retried.
    #[error("request signing failed: {0}")]
    Signing(String),

    /// A persistence collaborator failed outside of payment recording.
    #[error("persistence operation failed: {0}")]
    Persistence(String),

    /// The remote payment succeeded but the local record could not be
    /// written. Distinct from payment failure on purpose.
    #[error("payment succeeded but the local record could not be written: {0}")]
    RecordingFailed(String),

    /// Caller-supplied parameters failed validation before any remote call.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// No user binding exists for the given user identifier.
    #[error("no binding found for the given user identifier")]
    UserNotFound,

    /// Startup configuration is missing or out of range.
    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// True when the payment definitively did not happen on the remote side.
    ///
    /// [`RecordingFailed`](Self::RecordingFailed) returns `false`: the
    /// payment went through even though bookkeeping did not.
    pub fn payment_definitely_failed(&self) -> bool {
        !matches!(self, Self::RecordingFailed(_))
    }
}
