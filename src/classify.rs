//! Response classification.
//!
//! Every decoded provider response is reduced to one control [`Outcome`]
//! that tells the dispatcher what to do next, plus a domain error for
//! non-success responses. The code tables are immutable static data: the
//! same classification is shared by the pay, refund, cancel, query, and
//! token-exchange calls rather than reimplemented per workflow.

use std::{collections::HashMap, sync::LazyLock};

use crate::error::GatewayError;

/// Control outcome the dispatcher acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Proceed with the result payload.
    Success,
    /// Transient backend fault: resend the identical signed request after a
    /// short wait.
    RetryImmediate,
    /// An async outcome is pending (e.g. the buyer is entering a password):
    /// stop resending and poll the order status instead.
    RetryPoll,
    /// The cached delegation token is no longer valid. Reported upward;
    /// looping cannot make progress without external action.
    ReauthRequired,
    /// Terminal outcome, no further automatic action.
    Stop,
}

/// Classification of one provider response.
#[derive(Debug)]
pub struct Classification {
    /// What the dispatcher should do next.
    pub outcome: Outcome,
    /// Domain error derived from the code tables; `None` only on success.
    pub error: Option<GatewayError>,
}

/// Domain kinds the static `code + sub_code` table resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DomainCode {
    AuthCodeInvalid,
    AlreadyPaid,
    TradeNotFound,
    TradeStatusError,
    BalanceInsufficient,
    RefundAmount,
    AccessForbidden,
}

static DOMAIN_CODES: LazyLock<HashMap<&'static str, DomainCode>> = LazyLock::new(|| {
    HashMap::from([
        ("40004ACQ.PAYMENT_AUTH_CODE_INVALID", DomainCode::AuthCodeInvalid),
        ("40004ACQ.TRADE_HAS_SUCCESS", DomainCode::AlreadyPaid),
        ("40004ACQ.TRADE_NOT_EXIST", DomainCode::TradeNotFound),
        ("40004ACQ.TRADE_STATUS_ERROR", DomainCode::TradeStatusError),
        ("40004ACQ.SELLER_BALANCE_NOT_ENOUGH", DomainCode::BalanceInsufficient),
        ("40004ACQ.REFUND_AMT_NOT_EQUAL_TOTAL", DomainCode::RefundAmount),
        ("40004ACQ.ACCESS_FORBIDDEN", DomainCode::AccessForbidden),
    ])
});

impl DomainCode {
    fn into_error(self) -> GatewayError {
        match self {
            Self::AuthCodeInvalid => GatewayError::AuthCodeInvalid,
            Self::AlreadyPaid => {
                GatewayError::TradeStatusConflict("trade already paid".to_owned())
            }
            Self::TradeNotFound => GatewayError::TradeNotFound,
            Self::TradeStatusError => GatewayError::TradeStatusConflict(
                "trade status does not allow this operation".to_owned(),
            ),
            Self::BalanceInsufficient => GatewayError::BalanceInsufficient,
            Self::RefundAmount => GatewayError::RefundAmount,
            Self::AccessForbidden => GatewayError::Authorization,
        }
    }
}

/// Maps a provider response code pair to a domain error.
///
/// Falls back to the generic [`GatewayError::Provider`] when the table has
/// no entry.
pub fn domain_error(code: &str, sub_code: Option<&str>) -> GatewayError {
    let sub = sub_code.unwrap_or_default();
    let key = format!("{code}{sub}");
    match DOMAIN_CODES.get(key.as_str()) {
        Some(domain) => domain.into_error(),
        None => GatewayError::Provider { code: code.to_owned(), sub_code: sub.to_owned() },
    }
}

/// Classifies one decoded response code pair.
pub fn classify(code: &str, sub_code: Option<&str>) -> Classification {
    let outcome = match code {
        "10000" => Outcome::Success,
        "20000" => Outcome::RetryImmediate,
        "10003" => Outcome::RetryPoll,
        "20001" => Outcome::ReauthRequired,
        _ => Outcome::Stop,
    };
    let error = match outcome {
        Outcome::Success => None,
        Outcome::ReauthRequired => Some(GatewayError::Authorization),
        _ => Some(domain_error(code, sub_code)),
    };
    Classification { outcome, error }
}
