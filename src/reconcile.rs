//! Trade reconciliation: merging dispatch outcomes into the local ledger.
//!
//! The reconciler decides insert vs. update by external order ID and keeps
//! the invariant of one Trade row per (external order ID, channel) pair. The
//! lookup-then-write sequence for a given order ID runs under a per-key
//! lock, so concurrent operations on the same unseen order cannot both
//! decide "not found, insert" and produce duplicate rows. Replaying an
//! identical successful outcome is therefore idempotent.
//!
//! Persistence faults while recording a *successful* payment surface as
//! [`GatewayError::RecordingFailed`], distinct from payment failures: the
//! money moved, only the bookkeeping needs repair.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::{
    error::{GatewayError, Result},
    model::{CHANNEL, PayKind, Refund, RefundStatus, Trade, TradeStatus, new_record_id},
    store::{RefundStore, TradeFilter, TradeStore},
    wire::{self, QueryPayload},
};

/// Per-key async lock serializing lookup-then-write per external order ID.
///
/// Idle entries are swept on every acquisition so the map tracks only keys
/// with an operation in flight, not every key ever seen.
#[derive(Default)]
struct KeyedLock {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLock {
    async fn lock(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            // A strong count of 1 means only the map holds the slot: no
            // guard is live and no task is waiting on it.
            map.retain(|_, slot| Arc::strong_count(slot) > 1);
            map.entry(key.to_owned()).or_default().clone()
        };
        slot.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A successful payment as reported by the provider, ready to merge.
#[derive(Debug, Clone)]
pub struct PaymentOutcome {
    /// Merchant-assigned external order ID.
    pub out_trade_id: String,
    /// Provider-assigned trade ID.
    pub provider_trade_id: String,
    /// Paid amount in minor units.
    pub amount: i64,
    /// Merchant the trade settled to.
    pub merchant_id: String,
    /// End-user the operation executed under.
    pub user_id: String,
    /// Front-end surface.
    pub kind: PayKind,
    /// Payment completion time.
    pub paid_at: DateTime<Utc>,
}

/// A not-yet-paid order to hold locally while the buyer completes payment
/// elsewhere.
#[derive(Debug, Clone)]
pub struct PendingOrder {
    /// Merchant-assigned external order ID.
    pub out_trade_id: String,
    /// Order amount in minor units.
    pub amount: i64,
    /// Merchant the trade will settle to.
    pub merchant_id: String,
    /// Front-end surface.
    pub kind: PayKind,
    /// Free-form passthrough field.
    pub passback: String,
}

/// A provider-confirmed refund ready to append to the ledger.
#[derive(Debug, Clone)]
pub struct RefundOutcome {
    /// Merchant-assigned refund request ID.
    pub out_refund_id: String,
    /// External order ID of the source trade.
    pub source_out_trade_id: String,
    /// Provider-assigned ID for the refunded trade.
    pub provider_refund_id: String,
    /// Refunded amount in minor units.
    pub amount: i64,
    /// Merchant the refund drew from.
    pub merchant_id: String,
    /// End-user the operation executed under.
    pub user_id: String,
    /// Caller-supplied refund reason.
    pub memo: String,
}

/// Merges dispatch results into Trade/Refund rows.
#[derive(Clone)]
pub struct TradeReconciler {
    trades: Arc<dyn TradeStore>,
    refunds: Arc<dyn RefundStore>,
    locks: Arc<KeyedLock>,
    refund_locks: Arc<KeyedLock>,
}

impl TradeReconciler {
    /// Creates a reconciler over the trade and refund stores.
    pub fn new(trades: Arc<dyn TradeStore>, refunds: Arc<dyn RefundStore>) -> Self {
        Self {
            trades,
            refunds,
            locks: Arc::new(KeyedLock::default()),
            refund_locks: Arc::new(KeyedLock::default()),
        }
    }

    /// Serializes a whole operation against one external order ID.
    ///
    /// The recording methods lock internally, but a workflow that checks a
    /// balance before a remote call must hold this guard across the entire
    /// check, dispatch, and record sequence. Without it, two concurrent
    /// refunds can both read the same refunded total, both pass the cap,
    /// and both get recorded.
    pub async fn lock_order(&self, out_trade_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        self.locks.lock(out_trade_id).await
    }

    /// Inserts or updates the pending local row for an order about to be
    /// paid. The internal ID and creation time of an existing row are
    /// preserved.
    pub async fn upsert_pending(&self, order: PendingOrder, now: DateTime<Utc>) -> Result<Trade> {
        let _guard = self.locks.lock(&order.out_trade_id).await;
        let filter = TradeFilter::by_out_trade_id(&order.out_trade_id, CHANNEL);
        let existing = self.trades.get_trade(&filter)?;
        let trade = match existing {
            Some(mut trade) => {
                trade.amount = order.amount;
                trade.kind = order.kind;
                trade.merchant_id = order.merchant_id;
                trade.passback = order.passback;
                trade.status = TradeStatus::WaitPay;
                trade.updated_at = now;
                self.trades.update_trade(&trade.id.clone(), &trade)?;
                trade
            }
            None => {
                let trade = Trade {
                    id: new_record_id(),
                    out_trade_id: order.out_trade_id,
                    trade_id: String::new(),
                    amount: order.amount,
                    status: TradeStatus::WaitPay,
                    channel: CHANNEL.to_owned(),
                    kind: order.kind,
                    merchant_id: order.merchant_id,
                    user_id: String::new(),
                    created_at: now,
                    updated_at: now,
                    paid_at: None,
                    passback: order.passback,
                };
                self.trades.insert_trade(&trade)?;
                trade
            }
        };
        Ok(trade)
    }

    /// Merges a successful payment into the ledger.
    ///
    /// Idempotent per external order ID: replaying the same outcome updates
    /// the one existing row instead of creating a second one.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RecordingFailed`] on persistence faults;
    /// the payment itself already succeeded.
    #[instrument(skip(self, outcome), fields(out_trade_id = %outcome.out_trade_id))]
    pub async fn record_payment_success(&self, outcome: PaymentOutcome) -> Result<Trade> {
        let _guard = self.locks.lock(&outcome.out_trade_id).await;
        let filter = TradeFilter::by_out_trade_id(&outcome.out_trade_id, CHANNEL);
        let existing = self
            .trades
            .get_trade(&filter)
            .map_err(|e| GatewayError::RecordingFailed(e.to_string()))?;
        let trade = match existing {
            Some(mut trade) => {
                trade.trade_id = outcome.provider_trade_id;
                trade.amount = outcome.amount;
                trade.status = TradeStatus::Success;
                trade.merchant_id = outcome.merchant_id;
                trade.user_id = outcome.user_id;
                trade.paid_at = Some(outcome.paid_at);
                trade.updated_at = outcome.paid_at;
                self.trades
                    .update_trade(&trade.id.clone(), &trade)
                    .map_err(|e| GatewayError::RecordingFailed(e.to_string()))?;
                trade
            }
            None => {
                let trade = Trade {
                    id: new_record_id(),
                    out_trade_id: outcome.out_trade_id,
                    trade_id: outcome.provider_trade_id,
                    amount: outcome.amount,
                    status: TradeStatus::Success,
                    channel: CHANNEL.to_owned(),
                    kind: outcome.kind,
                    merchant_id: outcome.merchant_id,
                    user_id: outcome.user_id,
                    created_at: outcome.paid_at,
                    updated_at: outcome.paid_at,
                    paid_at: Some(outcome.paid_at),
                    passback: String::new(),
                };
                self.trades
                    .insert_trade(&trade)
                    .map_err(|e| GatewayError::RecordingFailed(e.to_string()))?;
                trade
            }
        };
        Ok(trade)
    }

    /// Merges a remote query result into the local row.
    ///
    /// The remote record is authoritative for status, amount, provider
    /// trade ID, and payment time; the local internal ID and creation time
    /// are preserved, never regenerated. When no local row exists the
    /// remote view is returned **unpersisted** (empty internal ID):
    /// first-time sync discovery deliberately does not create ledger rows,
    /// creation belongs to the payment workflows.
    pub async fn sync_remote(
        &self,
        out_trade_id: &str,
        remote: &QueryPayload,
        merchant_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Trade> {
        let status = wire::trade_status_from_remote(&remote.trade_status).ok_or_else(|| {
            GatewayError::Protocol(format!("unknown trade status {:?}", remote.trade_status))
        })?;
        let amount = wire::minor_units_from_wire(&remote.total_amount)?;
        let paid_at = remote.send_pay_date.as_deref().and_then(wire::parse_wire_time);

        let _guard = self.locks.lock(out_trade_id).await;
        let filter = TradeFilter::by_out_trade_id(out_trade_id, CHANNEL);
        let local = self.trades.get_trade(&filter)?;
        let trade = match local {
            Some(mut trade) => {
                trade.trade_id = remote.trade_no.clone();
                trade.status = status;
                trade.amount = amount;
                trade.merchant_id = merchant_id.to_owned();
                trade.user_id = user_id.to_owned();
                trade.paid_at = paid_at;
                trade.updated_at = now;
                self.trades
                    .update_trade(&trade.id.clone(), &trade)
                    .map_err(|e| GatewayError::Persistence(e.to_string()))?;
                trade
            }
            None => Trade {
                id: String::new(),
                out_trade_id: out_trade_id.to_owned(),
                trade_id: remote.trade_no.clone(),
                amount,
                status,
                channel: CHANNEL.to_owned(),
                kind: PayKind::Bar,
                merchant_id: merchant_id.to_owned(),
                user_id: user_id.to_owned(),
                created_at: now,
                updated_at: now,
                paid_at,
                passback: String::new(),
            },
        };
        Ok(trade)
    }

    /// Verifies a refund request fits within the refundable balance of its
    /// source trade.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidParams`] for non-positive amounts;
    /// [`GatewayError::RefundAmount`] when already-successful refunds plus
    /// the request would exceed the trade amount.
    pub fn check_refundable(&self, trade: &Trade, amount: i64) -> Result<()> {
        if amount <= 0 {
            return Err(GatewayError::InvalidParams(
                "refund amount must be positive".to_owned(),
            ));
        }
        let refunded = self.refunds.total_refunded(&trade.out_trade_id, CHANNEL)?;
        if refunded + amount > trade.amount {
            return Err(GatewayError::RefundAmount);
        }
        Ok(())
    }

    /// Appends a provider-confirmed refund to the ledger.
    ///
    /// Refund rows are append-only per request ID: replaying a request ID
    /// that already exists returns the stored row untouched.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RecordingFailed`] on persistence faults;
    /// the refund itself already succeeded.
    pub async fn record_refund(
        &self,
        outcome: RefundOutcome,
        now: DateTime<Utc>,
    ) -> Result<Refund> {
        // Refund request IDs get their own lock map: the caller may already
        // hold the order lock for the source trade.
        let _guard = self.refund_locks.lock(&outcome.out_refund_id).await;
        if let Some(existing) = self
            .refunds
            .get_refund(&outcome.out_refund_id, CHANNEL)
            .map_err(|e| GatewayError::RecordingFailed(e.to_string()))?
        {
            return Ok(existing);
        }
        let refund = Refund {
            id: new_record_id(),
            out_refund_id: outcome.out_refund_id,
            refund_id: outcome.provider_refund_id,
            source_out_trade_id: outcome.source_out_trade_id,
            amount: outcome.amount,
            status: RefundStatus::Success,
            channel: CHANNEL.to_owned(),
            merchant_id: outcome.merchant_id,
            user_id: outcome.user_id,
            created_at: now,
            updated_at: now,
            refunded_at: Some(now),
            memo: outcome.memo,
        };
        self.refunds
            .insert_refund(&refund)
            .map_err(|e| GatewayError::RecordingFailed(e.to_string()))?;
        Ok(refund)
    }
}

impl std::fmt::Debug for TradeReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeReconciler").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::store::MemoryLedger;

    fn fixture() -> (Arc<MemoryLedger>, TradeReconciler) {
        let store = Arc::new(MemoryLedger::new());
        let reconciler = TradeReconciler::new(store.clone(), store.clone());
        (store, reconciler)
    }

    fn outcome(out_trade_id: &str) -> PaymentOutcome {
        PaymentOutcome {
            out_trade_id: out_trade_id.to_owned(),
            provider_trade_id: "T100".to_owned(),
            amount: 500,
            merchant_id: "m1".to_owned(),
            user_id: String::new(),
            kind: PayKind::Bar,
            paid_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_replayed_success_is_idempotent() {
        let (store, reconciler) = fixture();
        let first = reconciler.record_payment_success(outcome("order-1")).await.unwrap();
        let second = reconciler.record_payment_success(outcome("order-1")).await.unwrap();
        assert_eq!(store.trade_count(), 1);
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, TradeStatus::Success);
    }

    #[tokio::test]
    async fn test_success_updates_pending_row_in_place() {
        let (store, reconciler) = fixture();
        let pending = reconciler
            .upsert_pending(
                PendingOrder {
                    out_trade_id: "order-1".to_owned(),
                    amount: 500,
                    merchant_id: "m1".to_owned(),
                    kind: PayKind::Bar,
                    passback: "keep-me".to_owned(),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let paid = reconciler.record_payment_success(outcome("order-1")).await.unwrap();
        assert_eq!(store.trade_count(), 1);
        assert_eq!(paid.id, pending.id);
        assert_eq!(paid.created_at, pending.created_at);
        assert_eq!(paid.passback, "keep-me");
        assert_eq!(paid.trade_id, "T100");
    }

    #[tokio::test]
    async fn test_upsert_pending_preserves_internal_id() {
        let (_, reconciler) = fixture();
        let order = PendingOrder {
            out_trade_id: "order-1".to_owned(),
            amount: 100,
            merchant_id: "m1".to_owned(),
            kind: PayKind::Web,
            passback: String::new(),
        };
        let first = reconciler.upsert_pending(order.clone(), Utc::now()).await.unwrap();
        let second = reconciler.upsert_pending(order, Utc::now()).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_sync_remote_preserves_id_and_creation_time() {
        let (_, reconciler) = fixture();
        let pending = reconciler
            .upsert_pending(
                PendingOrder {
                    out_trade_id: "order-1".to_owned(),
                    amount: 100,
                    merchant_id: "m1".to_owned(),
                    kind: PayKind::Bar,
                    passback: String::new(),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let remote = QueryPayload {
            trade_no: "T200".to_owned(),
            out_trade_no: String::new(),
            trade_status: "TRADE_SUCCESS".to_owned(),
            total_amount: "2.50".to_owned(),
            send_pay_date: Some("2024-05-01 10:30:00".to_owned()),
        };
        let synced = reconciler
            .sync_remote("order-1", &remote, "m1", "", Utc::now())
            .await
            .unwrap();
        assert_eq!(synced.id, pending.id);
        assert_eq!(synced.created_at, pending.created_at);
        // Remote is authoritative for status, amount, and payment time.
        assert_eq!(synced.status, TradeStatus::Success);
        assert_eq!(synced.amount, 250);
        assert!(synced.paid_at.is_some());
    }

    #[tokio::test]
    async fn test_sync_remote_unknown_locally_does_not_insert() {
        let (store, reconciler) = fixture();
        let remote = QueryPayload {
            trade_no: "T300".to_owned(),
            out_trade_no: String::new(),
            trade_status: "WAIT_BUYER_PAY".to_owned(),
            total_amount: "1.00".to_owned(),
            send_pay_date: None,
        };
        let trade = reconciler
            .sync_remote("order-x", &remote, "m1", "", Utc::now())
            .await
            .unwrap();
        assert!(trade.id.is_empty());
        assert_eq!(store.trade_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_remote_rejects_unknown_status() {
        let (_, reconciler) = fixture();
        let remote = QueryPayload {
            trade_no: "T1".to_owned(),
            out_trade_no: String::new(),
            trade_status: "HALF_PAID".to_owned(),
            total_amount: "1.00".to_owned(),
            send_pay_date: None,
        };
        let result = reconciler.sync_remote("order-1", &remote, "m1", "", Utc::now()).await;
        assert!(matches!(result, Err(GatewayError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_refund_cap_enforced() {
        let (_, reconciler) = fixture();
        let trade = reconciler.record_payment_success(outcome("order-1")).await.unwrap();
        reconciler
            .record_refund(
                RefundOutcome {
                    out_refund_id: "r1".to_owned(),
                    source_out_trade_id: "order-1".to_owned(),
                    provider_refund_id: "T100".to_owned(),
                    amount: 400,
                    merchant_id: "m1".to_owned(),
                    user_id: String::new(),
                    memo: String::new(),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        // 400 of 500 already refunded: 100 passes, 101 does not.
        assert!(reconciler.check_refundable(&trade, 100).is_ok());
        assert!(matches!(
            reconciler.check_refundable(&trade, 101),
            Err(GatewayError::RefundAmount)
        ));
        assert!(matches!(
            reconciler.check_refundable(&trade, 0),
            Err(GatewayError::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn test_refund_replay_returns_existing_row() {
        let (_, reconciler) = fixture();
        let refund = RefundOutcome {
            out_refund_id: "r1".to_owned(),
            source_out_trade_id: "order-1".to_owned(),
            provider_refund_id: "T100".to_owned(),
            amount: 100,
            merchant_id: "m1".to_owned(),
            user_id: String::new(),
            memo: String::new(),
        };
        let first = reconciler.record_refund(refund.clone(), Utc::now()).await.unwrap();
        let second = reconciler.record_refund(refund, Utc::now()).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_idle_order_locks_are_swept() {
        let (_, reconciler) = fixture();
        for i in 0..5 {
            reconciler
                .record_payment_success(outcome(&format!("order-{i}")))
                .await
                .unwrap();
        }
        // Each acquisition sweeps entries no guard holds any more, so the
        // map never accumulates one slot per order ever seen.
        drop(reconciler.lock_order("order-next").await);
        assert_eq!(reconciler.locks.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_success_for_same_unseen_order_yields_one_row() {
        let (store, reconciler) = fixture();
        let (a, b) = tokio::join!(
            reconciler.record_payment_success(outcome("order-1")),
            reconciler.record_payment_success(outcome("order-1")),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(store.trade_count(), 1);
    }
}
