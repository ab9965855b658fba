//! Domain records persisted in the local ledger.
//!
//! A [`Trade`] is the unit of reconciliation: exactly one row exists per
//! (external order ID, channel) pair, and its internal ID is minted once at
//! first insertion and never changes afterwards. [`Refund`] rows are
//! append-only per refund request ID. [`Auth`] holds the delegation token for
//! a sub-merchant; [`User`] binds an end-user identifier to that Auth so
//! several users can share one token without refresh races.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel tag for records created by this integration.
pub const CHANNEL: &str = "alipay";

/// Mints a fresh internal record identifier.
pub(crate) fn new_record_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Lifecycle status of a [`Trade`].
///
/// `WaitPay -> {Success, Closed}`. `Success` is terminal for payment
/// purposes but the trade may later accumulate refunds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    /// Order created, payment not yet completed.
    WaitPay,
    /// Payment completed.
    Success,
    /// Order closed without payment.
    Closed,
}

/// Lifecycle status of a [`Refund`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    /// Refund accepted by the provider, funds not yet confirmed returned.
    Pending,
    /// Refund completed.
    Success,
}

/// Lifecycle status of an [`Auth`], mirrored onto bound [`User`] rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    /// Token exchanged but the delegation contract is not yet confirmed.
    WaitVerify,
    /// Delegation verified and usable.
    Success,
    /// Delegation was revoked or failed verification.
    Failed,
}

/// Front-end surface a payment was initiated from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayKind {
    /// Desktop web redirect flow.
    #[default]
    Web,
    /// In-app payment flow.
    App,
    /// Merchant-scans-buyer bar code flow.
    Bar,
}

/// A payment order in the local ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Internal ID, assigned once at first insertion.
    pub id: String,
    /// Merchant-assigned external order ID.
    pub out_trade_id: String,
    /// Provider-assigned trade ID, empty until the provider reports one.
    pub trade_id: String,
    /// Amount in minor currency units.
    pub amount: i64,
    /// Current lifecycle status.
    pub status: TradeStatus,
    /// Payment channel tag, [`CHANNEL`] for this integration.
    pub channel: String,
    /// Front-end surface the payment was initiated from.
    pub kind: PayKind,
    /// Merchant the trade settles to.
    pub merchant_id: String,
    /// End-user the operation executed under, empty in single-merchant mode.
    pub user_id: String,
    /// First local insertion time.
    pub created_at: DateTime<Utc>,
    /// Last local update time.
    pub updated_at: DateTime<Utc>,
    /// Payment completion time reported by the provider.
    pub paid_at: Option<DateTime<Utc>>,
    /// Free-form passthrough field echoed back by the provider.
    pub passback: String,
}

/// One refund against a [`Trade`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    /// Internal ID, assigned once at insertion.
    pub id: String,
    /// Merchant-assigned refund request ID. Refund rows are append-only per
    /// this key.
    pub out_refund_id: String,
    /// Provider-assigned refund/trade ID.
    pub refund_id: String,
    /// External order ID of the source trade.
    pub source_out_trade_id: String,
    /// Refunded amount in minor currency units.
    pub amount: i64,
    /// Current lifecycle status.
    pub status: RefundStatus,
    /// Payment channel tag.
    pub channel: String,
    /// Merchant the refund draws from.
    pub merchant_id: String,
    /// End-user the operation executed under.
    pub user_id: String,
    /// Local insertion time.
    pub created_at: DateTime<Utc>,
    /// Last local update time.
    pub updated_at: DateTime<Utc>,
    /// Refund completion time.
    pub refunded_at: Option<DateTime<Utc>>,
    /// Caller-supplied refund reason.
    pub memo: String,
}

/// A delegation grant from the provider to act on behalf of a merchant.
///
/// The token value is replaced, not versioned, on every exchange: the newest
/// token is authoritative and the previous one is implicitly invalidated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    /// Internal ID, assigned once at insertion.
    pub id: String,
    /// Provider-assigned merchant identifier the grant applies to.
    pub merchant_id: String,
    /// Account name bound to the grant, informational.
    pub account: String,
    /// Opaque delegation token.
    pub token: String,
    /// Current lifecycle status.
    pub status: AuthStatus,
    /// Payment channel tag.
    pub channel: String,
}

impl Auth {
    /// Synthesizes the single-merchant authorization: no delegation, always
    /// verified, settling to the configured top-level merchant.
    pub fn single_merchant(merchant_id: &str) -> Self {
        Self {
            id: String::new(),
            merchant_id: merchant_id.to_owned(),
            account: String::new(),
            token: String::new(),
            status: AuthStatus::Success,
            channel: CHANNEL.to_owned(),
        }
    }
}

/// A binding of an end-user identifier to a merchant's [`Auth`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Internal ID, assigned once at insertion.
    pub id: String,
    /// External end-user identifier.
    pub user_id: String,
    /// Merchant whose Auth this user resolves to; empty after unbinding.
    pub merchant_id: String,
    /// Status mirrored from the bound Auth.
    pub status: AuthStatus,
    /// Payment channel tag.
    pub channel: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_merchant_auth_is_verified() {
        let auth = Auth::single_merchant("2088000000000000");
        assert_eq!(auth.status, AuthStatus::Success);
        assert_eq!(auth.merchant_id, "2088000000000000");
        assert!(auth.token.is_empty());
    }

    #[test]
    fn test_record_ids_are_unique() {
        assert_ne!(new_record_id(), new_record_id());
    }
}
