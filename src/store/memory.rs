//! In-memory store implementation.
//!
//! Backs all four store traits with mutex-guarded maps. Useful for tests
//! and prototypes; a real deployment plugs in database-backed stores.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    error::Result,
    model::{Auth, AuthStatus, Refund, RefundStatus, Trade, User},
    store::{AuthStore, RefundStore, TradeFilter, TradeStore, UserStore},
};

/// Mutex-guarded in-memory ledger.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    trades: Mutex<HashMap<String, Trade>>,
    refunds: Mutex<HashMap<String, Refund>>,
    auths: Mutex<HashMap<String, Auth>>,
    users: Mutex<HashMap<String, User>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key(a: &str, b: &str) -> String {
    format!("{a}\u{1}{b}")
}

impl MemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of trade rows currently stored, for test assertions.
    #[must_use]
    pub fn trade_count(&self) -> usize {
        guard(&self.trades).len()
    }
}

impl TradeStore for MemoryLedger {
    fn get_trade(&self, filter: &TradeFilter) -> Result<Option<Trade>> {
        let trades = guard(&self.trades);
        let found = trades.values().find(|trade| {
            trade.channel == filter.channel
                && (filter.out_trade_id.is_empty() || trade.out_trade_id == filter.out_trade_id)
                && (filter.trade_id.is_empty() || trade.trade_id == filter.trade_id)
        });
        Ok(found.cloned())
    }

    fn insert_trade(&self, trade: &Trade) -> Result<()> {
        guard(&self.trades).insert(trade.id.clone(), trade.clone());
        Ok(())
    }

    fn update_trade(&self, id: &str, trade: &Trade) -> Result<()> {
        guard(&self.trades).insert(id.to_owned(), trade.clone());
        Ok(())
    }
}

impl RefundStore for MemoryLedger {
    fn get_refund(&self, out_refund_id: &str, channel: &str) -> Result<Option<Refund>> {
        Ok(guard(&self.refunds).get(&key(out_refund_id, channel)).cloned())
    }

    fn insert_refund(&self, refund: &Refund) -> Result<()> {
        guard(&self.refunds).insert(key(&refund.out_refund_id, &refund.channel), refund.clone());
        Ok(())
    }

    fn total_refunded(&self, source_out_trade_id: &str, channel: &str) -> Result<i64> {
        let total = guard(&self.refunds)
            .values()
            .filter(|refund| {
                refund.source_out_trade_id == source_out_trade_id
                    && refund.channel == channel
                    && refund.status == RefundStatus::Success
            })
            .map(|refund| refund.amount)
            .sum();
        Ok(total)
    }
}

impl AuthStore for MemoryLedger {
    fn get_auth(&self, merchant_id: &str, channel: &str) -> Result<Option<Auth>> {
        Ok(guard(&self.auths).get(&key(merchant_id, channel)).cloned())
    }

    fn insert_auth(&self, auth: &Auth) -> Result<()> {
        guard(&self.auths).insert(key(&auth.merchant_id, &auth.channel), auth.clone());
        Ok(())
    }

    fn update_auth(&self, merchant_id: &str, auth: &Auth) -> Result<()> {
        guard(&self.auths).insert(key(merchant_id, &auth.channel), auth.clone());
        Ok(())
    }
}

impl UserStore for MemoryLedger {
    fn get_user(&self, user_id: &str, channel: &str) -> Result<Option<User>> {
        Ok(guard(&self.users).get(&key(user_id, channel)).cloned())
    }

    fn insert_user(&self, user: &User) -> Result<()> {
        guard(&self.users).insert(key(&user.user_id, &user.channel), user.clone());
        Ok(())
    }

    fn update_user(&self, user_id: &str, user: &User) -> Result<()> {
        guard(&self.users).insert(key(user_id, &user.channel), user.clone());
        Ok(())
    }

    fn update_status_by_merchant(
        &self,
        merchant_id: &str,
        channel: &str,
        status: AuthStatus,
    ) -> Result<()> {
        let mut users = guard(&self.users);
        for user in users.values_mut() {
            if user.merchant_id == merchant_id && user.channel == channel {
                user.status = status;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::{CHANNEL, PayKind, TradeStatus, new_record_id};

    fn sample_trade(out_trade_id: &str) -> Trade {
        let now = Utc::now();
        Trade {
            id: new_record_id(),
            out_trade_id: out_trade_id.to_owned(),
            trade_id: String::new(),
            amount: 100,
            status: TradeStatus::WaitPay,
            channel: CHANNEL.to_owned(),
            kind: PayKind::Bar,
            merchant_id: "m1".to_owned(),
            user_id: String::new(),
            created_at: now,
            updated_at: now,
            paid_at: None,
            passback: String::new(),
        }
    }

    #[test]
    fn test_trade_lookup_by_out_trade_id() {
        let store = MemoryLedger::new();
        store.insert_trade(&sample_trade("order-1")).unwrap();
        let found = store
            .get_trade(&TradeFilter::by_out_trade_id("order-1", CHANNEL))
            .unwrap();
        assert!(found.is_some());
        let missing = store
            .get_trade(&TradeFilter::by_out_trade_id("order-2", CHANNEL))
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_trade_update_keeps_one_row() {
        let store = MemoryLedger::new();
        let mut trade = sample_trade("order-1");
        store.insert_trade(&trade).unwrap();
        trade.status = TradeStatus::Success;
        store.update_trade(&trade.id.clone(), &trade).unwrap();
        assert_eq!(store.trade_count(), 1);
        let found = store
            .get_trade(&TradeFilter::by_out_trade_id("order-1", CHANNEL))
            .unwrap()
            .unwrap();
        assert_eq!(found.status, TradeStatus::Success);
    }

    #[test]
    fn test_total_refunded_counts_only_success() {
        let store = MemoryLedger::new();
        let now = Utc::now();
        for (id, amount, status) in [
            ("r1", 30, RefundStatus::Success),
            ("r2", 20, RefundStatus::Success),
            ("r3", 40, RefundStatus::Pending),
        ] {
            store
                .insert_refund(&Refund {
                    id: new_record_id(),
                    out_refund_id: id.to_owned(),
                    refund_id: String::new(),
                    source_out_trade_id: "order-1".to_owned(),
                    amount,
                    status,
                    channel: CHANNEL.to_owned(),
                    merchant_id: "m1".to_owned(),
                    user_id: String::new(),
                    created_at: now,
                    updated_at: now,
                    refunded_at: None,
                    memo: String::new(),
                })
                .unwrap();
        }
        assert_eq!(store.total_refunded("order-1", CHANNEL).unwrap(), 50);
    }

    #[test]
    fn test_update_status_by_merchant() {
        let store = MemoryLedger::new();
        for (user_id, merchant_id) in [("u1", "m1"), ("u2", "m1"), ("u3", "m2")] {
            store
                .insert_user(&User {
                    id: new_record_id(),
                    user_id: user_id.to_owned(),
                    merchant_id: merchant_id.to_owned(),
                    status: AuthStatus::WaitVerify,
                    channel: CHANNEL.to_owned(),
                })
                .unwrap();
        }
        store
            .update_status_by_merchant("m1", CHANNEL, AuthStatus::Success)
            .unwrap();
        assert_eq!(store.get_user("u1", CHANNEL).unwrap().unwrap().status, AuthStatus::Success);
        assert_eq!(store.get_user("u2", CHANNEL).unwrap().unwrap().status, AuthStatus::Success);
        assert_eq!(
            store.get_user("u3", CHANNEL).unwrap().unwrap().status,
            AuthStatus::WaitVerify
        );
    }
}
