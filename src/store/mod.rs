//! Persistence collaborator interfaces.
//!
//! The engine consumes these traits; it never owns CRUD. All methods are
//! synchronous and return `Ok(None)` for "not found" rather than an error.
//! Implementations must be safe to call from concurrent operations; the
//! reconciler adds its own per-order serialization on top (see
//! [`crate::reconcile`]), so stores are not required to make
//! lookup-then-insert atomic themselves.

mod memory;

pub use memory::MemoryLedger;

use std::sync::Arc;

use crate::{
    error::Result,
    model::{Auth, AuthStatus, Refund, Trade, User},
};

/// Filter for trade lookups. Empty fields are ignored; the channel is
/// always part of the key.
#[derive(Debug, Clone, Default)]
pub struct TradeFilter {
    /// Match on the merchant-assigned external order ID.
    pub out_trade_id: String,
    /// Match on the provider-assigned trade ID.
    pub trade_id: String,
    /// Payment channel tag.
    pub channel: String,
}

impl TradeFilter {
    /// Filter by external order ID within a channel.
    #[must_use]
    pub fn by_out_trade_id(out_trade_id: &str, channel: &str) -> Self {
        Self {
            out_trade_id: out_trade_id.to_owned(),
            channel: channel.to_owned(),
            ..Self::default()
        }
    }
}

/// Trade row storage.
pub trait TradeStore: Send + Sync {
    /// Looks up one trade. `Ok(None)` when nothing matches.
    fn get_trade(&self, filter: &TradeFilter) -> Result<Option<Trade>>;

    /// Inserts a new trade row.
    fn insert_trade(&self, trade: &Trade) -> Result<()>;

    /// Updates the trade row with the given internal ID.
    fn update_trade(&self, id: &str, trade: &Trade) -> Result<()>;
}

/// Refund row storage. Rows are append-only per refund request ID.
pub trait RefundStore: Send + Sync {
    /// Looks up a refund by its external request ID.
    fn get_refund(&self, out_refund_id: &str, channel: &str) -> Result<Option<Refund>>;

    /// Inserts a new refund row.
    fn insert_refund(&self, refund: &Refund) -> Result<()>;

    /// Total amount of successful refunds recorded against a source trade.
    fn total_refunded(&self, source_out_trade_id: &str, channel: &str) -> Result<i64>;
}

/// Auth (delegation grant) storage, keyed by merchant ID and channel.
pub trait AuthStore: Send + Sync {
    /// Looks up the grant for a merchant.
    fn get_auth(&self, merchant_id: &str, channel: &str) -> Result<Option<Auth>>;

    /// Inserts a new grant.
    fn insert_auth(&self, auth: &Auth) -> Result<()>;

    /// Replaces the grant for a merchant.
    fn update_auth(&self, merchant_id: &str, auth: &Auth) -> Result<()>;
}

/// User binding storage, keyed by external user ID and channel.
pub trait UserStore: Send + Sync {
    /// Looks up a binding.
    fn get_user(&self, user_id: &str, channel: &str) -> Result<Option<User>>;

    /// Inserts a new binding.
    fn insert_user(&self, user: &User) -> Result<()>;

    /// Replaces a binding.
    fn update_user(&self, user_id: &str, user: &User) -> Result<()>;

    /// Mirrors an auth status onto every user bound to a merchant.
    fn update_status_by_merchant(
        &self,
        merchant_id: &str,
        channel: &str,
        status: AuthStatus,
    ) -> Result<()>;
}

/// The set of persistence collaborators one client operates on.
#[derive(Clone)]
pub struct Ledger {
    /// Trade rows.
    pub trades: Arc<dyn TradeStore>,
    /// Refund rows.
    pub refunds: Arc<dyn RefundStore>,
    /// Delegation grants.
    pub auths: Arc<dyn AuthStore>,
    /// User bindings.
    pub users: Arc<dyn UserStore>,
}

impl Ledger {
    /// Builds a ledger backed by one shared in-memory store, handy for
    /// tests and prototypes.
    #[must_use]
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryLedger::new());
        Self {
            trades: store.clone(),
            refunds: store.clone(),
            auths: store.clone(),
            users: store,
        }
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}
