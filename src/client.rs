//! Gateway client and workflows.
//!
//! Each public operation composes the same pipeline: resolve authorization,
//! assemble and sign parameters, dispatch with the retry/poll policy, and
//! reconcile the outcome into the ledger. Every operation opens its own
//! [`RequestContext`]; nothing per-call lives on the client itself, so
//! concurrent operations under different merchants cannot interfere.

use std::{collections::BTreeMap, sync::Arc};

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{instrument, warn};

use crate::{
    auth::AuthRegistry,
    clock::{Clock, SystemClock},
    config::GatewayConfig,
    dispatch::{DispatchOutcome, Dispatcher, PollVerdict, RequestContext, SignedRequest},
    error::{GatewayError, Result},
    model::{Auth, AuthStatus, CHANNEL, PayKind, Refund, Trade, TradeStatus, User, new_record_id},
    reconcile::{PaymentOutcome, PendingOrder, RefundOutcome, TradeReconciler},
    sign::{RequestSigner, SIGN_FIELD},
    store::{Ledger, TradeFilter},
    transport::{HttpTransport, Transport},
    wire::{self, PayPayload, QueryPayload, RefundPayload, TokenPayload, method},
};

/// Deliberately unknown provider trade ID used to probe whether a
/// delegation actually works: any answer except an authorization error
/// proves the grant is live.
const AUTH_PROBE_TRADE_ID: &str = "delegation-probe-nonexistent";

/// Parameters for the front-end payment flow ([`GatewayClient::pay_params`]).
#[derive(Debug, Clone, Default)]
pub struct PayRequest {
    /// Merchant-assigned external order ID.
    pub out_trade_id: String,
    /// Amount in minor currency units.
    pub amount: i64,
    /// Order title shown to the buyer.
    pub subject: String,
    /// Order detail text.
    pub detail: String,
    /// Store identifier, optional.
    pub shop_id: String,
    /// URL the buyer returns to after paying.
    pub return_url: String,
    /// Free-form passthrough echoed in notifications.
    pub passback: String,
    /// Front-end surface; decides the gateway method.
    pub kind: PayKind,
}

/// Signed parameter bundle for a front-end initiated payment.
///
/// Returned unexecuted: the front end performs the actual gateway request
/// so key material never leaves the server.
#[derive(Debug, Clone)]
pub struct PayParams {
    /// URL-encoded signed query string.
    pub query: String,
    /// The same parameters as a JSON object, for clients that post forms.
    pub source: String,
}

/// Parameters for the merchant-scans-buyer flow ([`GatewayClient::bar_pay`]).
#[derive(Debug, Clone, Default)]
pub struct BarPayRequest {
    /// Merchant-assigned external order ID. Must not be reused once paid.
    pub out_trade_id: String,
    /// One-time payment code scanned off the buyer's device.
    pub auth_code: String,
    /// Amount in minor currency units.
    pub amount: i64,
    /// Order title shown to the buyer.
    pub subject: String,
    /// Order detail text.
    pub detail: String,
    /// Store identifier, optional.
    pub shop_id: String,
    /// End-user the operation executes under; empty for single-merchant
    /// mode.
    pub user_id: String,
    /// Merchant hint when the user has no binding.
    pub merchant_id: String,
}

/// Parameters for [`GatewayClient::refund`].
#[derive(Debug, Clone, Default)]
pub struct RefundRequest {
    /// External order ID of the trade being refunded.
    pub source_out_trade_id: String,
    /// Merchant-assigned refund request ID; refunds are append-only per
    /// this key.
    pub out_refund_id: String,
    /// Refund amount in minor currency units.
    pub amount: i64,
    /// Refund reason.
    pub memo: String,
    /// End-user the operation executes under.
    pub user_id: String,
    /// Merchant hint when the user has no binding.
    pub merchant_id: String,
}

/// Parameters for [`GatewayClient::cancel`].
#[derive(Debug, Clone, Default)]
pub struct CancelRequest {
    /// Merchant-assigned external order ID.
    pub out_trade_id: String,
    /// Provider-assigned trade ID, when known.
    pub trade_id: String,
    /// End-user the operation executes under.
    pub user_id: String,
    /// Merchant hint when the user has no binding.
    pub merchant_id: String,
}

/// Parameters for [`GatewayClient::trade_info`].
#[derive(Debug, Clone, Default)]
pub struct TradeQuery {
    /// Merchant-assigned external order ID.
    pub out_trade_id: String,
    /// Provider-assigned trade ID.
    pub trade_id: String,
    /// End-user the operation executes under.
    pub user_id: String,
    /// Merchant hint when the user has no binding.
    pub merchant_id: String,
}

/// Parameters for [`GatewayClient::auth_signed`].
#[derive(Debug, Clone)]
pub struct AuthConfirm {
    /// Merchant whose grant is being confirmed.
    pub merchant_id: String,
    /// Account name reported by the provider at contract signing.
    pub account: String,
    /// Status the provider reports for the contract.
    pub status: AuthStatus,
}

/// Client for one payment gateway account.
///
/// Cheap to share behind an `Arc`; all methods take `&self` and are safe to
/// call concurrently.
pub struct GatewayClient {
    config: GatewayConfig,
    signer: RequestSigner,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    ledger: Ledger,
    registry: AuthRegistry,
    reconciler: TradeReconciler,
}

impl GatewayClient {
    /// Creates a client with the production transport and clock.
    ///
    /// Loads the private key once; missing or invalid configuration is a
    /// fatal construction error.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] on invalid configuration or
    /// unreadable key material.
    pub fn new(config: GatewayConfig, ledger: Ledger) -> Result<Self> {
        let signer = RequestSigner::from_pem_file(&config.private_key_path)?;
        Self::with_parts(
            config,
            ledger,
            signer,
            Arc::new(HttpTransport::new()),
            Arc::new(SystemClock),
        )
    }

    /// Creates a client from explicit parts. The seam tests use to swap in
    /// a scripted transport and a manual clock.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] on invalid configuration.
    pub fn with_parts(
        config: GatewayConfig,
        ledger: Ledger,
        signer: RequestSigner,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new(transport, clock.clone(), config.dispatch.clone());
        let registry = AuthRegistry::new(
            ledger.auths.clone(),
            ledger.users.clone(),
            &config.service_merchant_id,
        );
        let reconciler = TradeReconciler::new(ledger.trades.clone(), ledger.refunds.clone());
        Ok(Self { config, signer, dispatcher, clock, ledger, registry, reconciler })
    }

    /// Builds and signs the parameter bundle for a front-end payment, with
    /// no remote call.
    ///
    /// Inserts or refreshes the pending local trade so later notifications
    /// and queries reconcile against it.
    ///
    /// # Errors
    ///
    /// [`GatewayError::TradeStatusConflict`] when the order ID was already
    /// paid.
    #[instrument(skip(self, req), fields(out_trade_id = %req.out_trade_id))]
    pub async fn pay_params(&self, req: &PayRequest) -> Result<PayParams> {
        if req.out_trade_id.is_empty() || req.amount <= 0 {
            return Err(GatewayError::InvalidParams(
                "out_trade_id and a positive amount are required".to_owned(),
            ));
        }
        self.reject_if_paid(&req.out_trade_id)?;

        let (gateway_method, product_code) = match req.kind {
            PayKind::App => (method::APP_PAY, "QUICK_MSECURITY_PAY"),
            PayKind::Web | PayKind::Bar => (method::PAGE_PAY, "FAST_INSTANT_TRADE_PAY"),
        };
        let biz = prune_empty(json!({
            "out_trade_no": req.out_trade_id,
            "total_amount": wire::wire_amount(req.amount),
            "subject": req.subject,
            "body": req.detail,
            "product_code": product_code,
            "store_id": req.shop_id,
            "passback_params": req.passback,
        }));
        let params = self.signed_params(
            gateway_method,
            &biz,
            None,
            &[
                ("return_url", req.return_url.clone()),
                ("notify_url", self.config.notify_url.clone()),
            ],
        )?;

        self.reconciler
            .upsert_pending(
                PendingOrder {
                    out_trade_id: req.out_trade_id.clone(),
                    amount: req.amount,
                    merchant_id: self.config.service_merchant_id.clone(),
                    kind: req.kind,
                    passback: req.passback.clone(),
                },
                self.clock.now(),
            )
            .await?;

        let source = serde_json::to_string(&params)
            .map_err(|e| GatewayError::Protocol(e.to_string()))?;
        Ok(PayParams { query: wire::build_query(&params), source })
    }

    /// Executes a merchant-scans-buyer payment end to end.
    ///
    /// Transient provider faults are resent; "buyer is entering a
    /// password" answers switch to polling the order status until it
    /// settles or the operation deadline passes. On failure or deadline a
    /// compensating cancel is issued automatically so no pending order
    /// dangles at the provider.
    ///
    /// # Errors
    ///
    /// Domain errors per the classifier tables;
    /// [`GatewayError::DeadlineExceeded`] after the deadline;
    /// [`GatewayError::RecordingFailed`] when the payment succeeded but the
    /// ledger write did not.
    #[instrument(skip(self, req), fields(out_trade_id = %req.out_trade_id))]
    pub async fn bar_pay(&self, req: &BarPayRequest) -> Result<Trade> {
        if req.out_trade_id.is_empty() || req.auth_code.is_empty() || req.amount <= 0 {
            return Err(GatewayError::InvalidParams(
                "out_trade_id, auth_code, and a positive amount are required".to_owned(),
            ));
        }
        let auth = self.registry.resolve_verified(&req.user_id, &req.merchant_id)?;
        let ctx = RequestContext::begin(self.clock.as_ref(), auth);
        self.reject_if_paid(&req.out_trade_id)?;

        let mut biz = prune_empty(json!({
            "out_trade_no": req.out_trade_id,
            "scene": "bar_code",
            "auth_code": req.auth_code,
            "subject": req.subject,
            "total_amount": wire::wire_amount(req.amount),
            "body": req.detail,
            "store_id": req.shop_id,
        }));
        if !self.config.service_merchant_id.is_empty() {
            biz["extend_params"] =
                json!({ "sys_service_provider_id": self.config.service_merchant_id });
        }
        let signed = self.signed_request(method::PAY, &biz, &ctx, &[])?;

        let dispatched = self
            .dispatcher
            .dispatch_with_poll(&signed, &ctx, || self.probe_trade(&ctx, &req.out_trade_id))
            .await;

        let (provider_trade_id, paid_at) = match dispatched {
            Ok(DispatchOutcome::Payload(value)) => {
                let payload: PayPayload = decode(value)?;
                let paid_at = payload
                    .gmt_payment
                    .as_deref()
                    .and_then(wire::parse_wire_time)
                    .unwrap_or_else(|| self.clock.now());
                (payload.trade_no, paid_at)
            }
            Ok(DispatchOutcome::Polled(payload)) => {
                let paid_at = payload
                    .send_pay_date
                    .as_deref()
                    .and_then(wire::parse_wire_time)
                    .unwrap_or_else(|| self.clock.now());
                (payload.trade_no, paid_at)
            }
            Err(error) => {
                if !matches!(error, GatewayError::Authorization) {
                    self.cancel_compensating(&ctx, &req.out_trade_id).await;
                }
                return Err(error);
            }
        };

        self.reconciler
            .record_payment_success(PaymentOutcome {
                out_trade_id: req.out_trade_id.clone(),
                provider_trade_id,
                amount: req.amount,
                merchant_id: ctx.auth.merchant_id.clone(),
                user_id: req.user_id.clone(),
                kind: PayKind::Bar,
                paid_at,
            })
            .await
    }

    /// Refunds part or all of a paid trade.
    ///
    /// The source trade must exist locally in `Success` status and the
    /// request must fit the refundable balance, otherwise the call is
    /// rejected before any remote request. On provider confirmation a new
    /// refund row is appended; rows are never updated in place.
    #[instrument(skip(self, req), fields(out_refund_id = %req.out_refund_id))]
    pub async fn refund(&self, req: &RefundRequest) -> Result<Refund> {
        if req.source_out_trade_id.is_empty() || req.out_refund_id.is_empty() {
            return Err(GatewayError::InvalidParams(
                "source_out_trade_id and out_refund_id are required".to_owned(),
            ));
        }
        let auth = self.registry.resolve_verified(&req.user_id, &req.merchant_id)?;
        let ctx = RequestContext::begin(self.clock.as_ref(), auth);

        // Held across check, dispatch, and record: concurrent refunds for
        // the same trade must see each other's rows, or two requests that
        // each fit the cap alone could both pass and overdraw it together.
        let _order_guard = self.reconciler.lock_order(&req.source_out_trade_id).await;

        let trade = self
            .ledger
            .trades
            .get_trade(&TradeFilter::by_out_trade_id(&req.source_out_trade_id, CHANNEL))?
            .ok_or(GatewayError::TradeNotFound)?;
        if trade.status != TradeStatus::Success {
            return Err(GatewayError::TradeStatusConflict(
                "refund requires a paid trade".to_owned(),
            ));
        }
        self.reconciler.check_refundable(&trade, req.amount)?;

        let biz = prune_empty(json!({
            "out_trade_no": req.source_out_trade_id,
            "out_request_no": req.out_refund_id,
            "refund_amount": wire::wire_amount(req.amount),
            "refund_reason": req.memo,
        }));
        let signed = self.signed_request(method::REFUND, &biz, &ctx, &[])?;
        let payload: RefundPayload = decode(self.dispatcher.dispatch(&signed, &ctx).await?)?;

        self.reconciler
            .record_refund(
                RefundOutcome {
                    out_refund_id: req.out_refund_id.clone(),
                    source_out_trade_id: req.source_out_trade_id.clone(),
                    provider_refund_id: payload.trade_no,
                    amount: req.amount,
                    merchant_id: ctx.auth.merchant_id.clone(),
                    user_id: req.user_id.clone(),
                    memo: req.memo.clone(),
                },
                self.clock.now(),
            )
            .await
    }

    /// Cancels an unpaid or ambiguous order at the provider.
    ///
    /// Direct invocation surfaces remote failure to the caller. The
    /// automatic compensation path inside [`bar_pay`](Self::bar_pay) uses
    /// the same request but only logs failures.
    #[instrument(skip(self, req), fields(out_trade_id = %req.out_trade_id))]
    pub async fn cancel(&self, req: &CancelRequest) -> Result<()> {
        let auth = self.registry.resolve_verified(&req.user_id, &req.merchant_id)?;
        let ctx = RequestContext::begin(self.clock.as_ref(), auth);
        self.send_cancel(&ctx, &req.out_trade_id, &req.trade_id).await
    }

    /// Returns the trade for a query, locally or synced from the provider.
    ///
    /// With `sync` false only the persisted row is consulted. With `sync`
    /// true the provider's record is fetched and is authoritative for
    /// status, amount, and payment time; the local internal ID and creation
    /// time survive the merge. A trade unknown locally is returned
    /// unpersisted (empty internal ID).
    #[instrument(skip(self, query), fields(out_trade_id = %query.out_trade_id))]
    pub async fn trade_info(&self, query: &TradeQuery, sync: bool) -> Result<Trade> {
        if query.out_trade_id.is_empty() && query.trade_id.is_empty() {
            return Err(GatewayError::InvalidParams(
                "out_trade_id or trade_id is required".to_owned(),
            ));
        }
        let auth = self.registry.resolve_verified(&query.user_id, &query.merchant_id)?;
        let ctx = RequestContext::begin(self.clock.as_ref(), auth);

        if !sync {
            let filter = TradeFilter {
                out_trade_id: query.out_trade_id.clone(),
                trade_id: query.trade_id.clone(),
                channel: CHANNEL.to_owned(),
            };
            return self.ledger.trades.get_trade(&filter)?.ok_or(GatewayError::TradeNotFound);
        }

        let payload = self.query_remote(&ctx, &query.out_trade_id, &query.trade_id).await?;
        let out_trade_id = if query.out_trade_id.is_empty() {
            payload.out_trade_no.clone()
        } else {
            query.out_trade_id.clone()
        };
        self.reconciler
            .sync_remote(
                &out_trade_id,
                &payload,
                &ctx.auth.merchant_id,
                &query.user_id,
                self.clock.now(),
            )
            .await
    }

    /// Exchanges a one-time authorization code for a delegation token.
    ///
    /// The resulting Auth is keyed by the provider-assigned merchant
    /// identifier, not by the code. A later exchange for the same merchant
    /// replaces the token in place: the newest token is authoritative.
    #[instrument(skip(self, code))]
    pub async fn auth_exchange(&self, code: &str) -> Result<Auth> {
        if code.is_empty() {
            return Err(GatewayError::InvalidParams("auth code is required".to_owned()));
        }
        let ctx = RequestContext::begin(
            self.clock.as_ref(),
            Auth::single_merchant(&self.config.service_merchant_id),
        );
        let biz = json!({ "grant_type": "authorization_code", "code": code });
        let signed = self.signed_request(method::TOKEN, &biz, &ctx, &[])?;
        let payload: TokenPayload = decode(self.dispatcher.dispatch(&signed, &ctx).await?)?;

        let existing = self.ledger.auths.get_auth(&payload.user_id, CHANNEL)?;
        let auth = match existing {
            Some(mut auth) => {
                auth.token = payload.app_auth_token;
                self.ledger.auths.update_auth(&payload.user_id, &auth)?;
                auth
            }
            None => {
                let auth = Auth {
                    id: new_record_id(),
                    merchant_id: payload.user_id,
                    account: String::new(),
                    token: payload.app_auth_token,
                    status: AuthStatus::WaitVerify,
                    channel: CHANNEL.to_owned(),
                };
                self.ledger.auths.insert_auth(&auth)?;
                auth
            }
        };
        Ok(auth)
    }

    /// Confirms a delegation contract after the provider reports it signed.
    ///
    /// Marking a grant verified first probes it with a real remote call
    /// against a deliberately unknown trade ID: any answer other than an
    /// authorization error proves the delegation works. The confirmed
    /// status is mirrored onto every user bound to the merchant.
    #[instrument(skip(self, req), fields(merchant_id = %req.merchant_id))]
    pub async fn auth_signed(&self, req: &AuthConfirm) -> Result<Auth> {
        let mut auth = self
            .ledger
            .auths
            .get_auth(&req.merchant_id, CHANNEL)?
            .ok_or(GatewayError::Authorization)?;

        if req.status != auth.status {
            auth.status = req.status;
            if auth.status == AuthStatus::Success {
                let ctx = RequestContext::begin(self.clock.as_ref(), auth.clone());
                match self.query_remote(&ctx, "", AUTH_PROBE_TRADE_ID).await {
                    Err(GatewayError::Authorization) => return Err(GatewayError::Authorization),
                    // Expected: the probe trade does not exist. Any
                    // non-authorization answer proves the grant is live.
                    Ok(_) | Err(_) => {}
                }
            }
        }
        if req.account != auth.account {
            auth.account = req.account.clone();
        }
        self.ledger.auths.update_auth(&auth.merchant_id, &auth)?;
        self.ledger
            .users
            .update_status_by_merchant(&auth.merchant_id, CHANNEL, auth.status)?;
        Ok(auth)
    }

    /// Binds an end-user identifier to a merchant's Auth.
    ///
    /// Several users may share one Auth; binding prevents repeated
    /// authorization from racing the token refresh. The user mirrors the
    /// Auth's status.
    pub fn bind_user(&self, user_id: &str, merchant_id: &str) -> Result<User> {
        if user_id.is_empty() || merchant_id.is_empty() {
            return Err(GatewayError::InvalidParams(
                "user_id and merchant_id are required".to_owned(),
            ));
        }
        let auth = self
            .ledger
            .auths
            .get_auth(merchant_id, CHANNEL)?
            .ok_or(GatewayError::Authorization)?;
        let user = match self.ledger.users.get_user(user_id, CHANNEL)? {
            Some(mut user) => {
                user.merchant_id = auth.merchant_id.clone();
                user.status = auth.status;
                self.ledger.users.update_user(user_id, &user)?;
                user
            }
            None => {
                let user = User {
                    id: new_record_id(),
                    user_id: user_id.to_owned(),
                    merchant_id: auth.merchant_id.clone(),
                    status: auth.status,
                    channel: CHANNEL.to_owned(),
                };
                self.ledger.users.insert_user(&user)?;
                user
            }
        };
        Ok(user)
    }

    /// Clears a user's merchant binding. The Auth itself stays valid.
    pub fn unbind_user(&self, user_id: &str) -> Result<User> {
        if user_id.is_empty() {
            return Err(GatewayError::InvalidParams("user_id is required".to_owned()));
        }
        let mut user = self
            .ledger
            .users
            .get_user(user_id, CHANNEL)?
            .ok_or(GatewayError::UserNotFound)?;
        user.merchant_id.clear();
        user.status = AuthStatus::WaitVerify;
        self.ledger.users.update_user(user_id, &user)?;
        Ok(user)
    }

    fn reject_if_paid(&self, out_trade_id: &str) -> Result<()> {
        let existing = self
            .ledger
            .trades
            .get_trade(&TradeFilter::by_out_trade_id(out_trade_id, CHANNEL))?;
        match existing {
            Some(trade) if trade.status == TradeStatus::Success => Err(
                GatewayError::TradeStatusConflict("trade already paid".to_owned()),
            ),
            _ => Ok(()),
        }
    }

    /// Assembles, signs, and returns the full parameter set for a call.
    fn signed_params(
        &self,
        gateway_method: &str,
        biz_content: &Value,
        auth_token: Option<&str>,
        extra: &[(&str, String)],
    ) -> Result<BTreeMap<String, String>> {
        let mut params = wire::sys_params(&self.config.app_id, self.clock.now());
        params.insert("method".to_owned(), gateway_method.to_owned());
        params.insert("biz_content".to_owned(), biz_content.to_string());
        if let Some(token) = auth_token {
            params.insert("app_auth_token".to_owned(), token.to_owned());
        }
        for (key, value) in extra {
            if !value.is_empty() {
                params.insert((*key).to_owned(), value.clone());
            }
        }
        let signature = self.signer.sign(&params)?;
        params.insert(SIGN_FIELD.to_owned(), signature);
        Ok(params)
    }

    fn signed_request(
        &self,
        gateway_method: &str,
        biz_content: &Value,
        ctx: &RequestContext,
        extra: &[(&str, String)],
    ) -> Result<SignedRequest> {
        let token = self.registry.delegation_token(&ctx.auth);
        let params = self.signed_params(gateway_method, biz_content, token, extra)?;
        Ok(SignedRequest::new(&self.config.gateway_url, gateway_method, &params))
    }

    /// One status query against the provider, signed fresh per call.
    async fn query_remote(
        &self,
        ctx: &RequestContext,
        out_trade_id: &str,
        trade_id: &str,
    ) -> Result<QueryPayload> {
        let biz = prune_empty(json!({
            "out_trade_no": out_trade_id,
            "trade_no": trade_id,
        }));
        let signed = self.signed_request(method::QUERY, &biz, ctx, &[])?;
        decode(self.dispatcher.dispatch(&signed, ctx).await?)
    }

    /// Status probe for the bar-pay poll loop.
    async fn probe_trade(&self, ctx: &RequestContext, out_trade_id: &str) -> Result<PollVerdict> {
        let payload = self.query_remote(ctx, out_trade_id, "").await?;
        match wire::trade_status_from_remote(&payload.trade_status) {
            Some(TradeStatus::Success) => Ok(PollVerdict::Succeeded(payload)),
            Some(TradeStatus::WaitPay) => Ok(PollVerdict::Pending),
            Some(TradeStatus::Closed) => Ok(PollVerdict::Failed),
            None => Err(GatewayError::Protocol(format!(
                "unknown trade status {:?}",
                payload.trade_status
            ))),
        }
    }

    /// Best-effort compensating cancel. Runs on a fresh deadline: the
    /// original operation's budget is already spent when compensation
    /// fires. Failures are logged, never escalated, so they cannot mask
    /// the outcome of the original call.
    async fn cancel_compensating(&self, ctx: &RequestContext, out_trade_id: &str) {
        let cancel_ctx = RequestContext::begin(self.clock.as_ref(), ctx.auth.clone());
        if let Err(error) = self.send_cancel(&cancel_ctx, out_trade_id, "").await {
            warn!(out_trade_id, error = %error, "compensating cancel failed");
        }
    }

    async fn send_cancel(
        &self,
        ctx: &RequestContext,
        out_trade_id: &str,
        trade_id: &str,
    ) -> Result<()> {
        let biz = prune_empty(json!({
            "out_trade_no": out_trade_id,
            "trade_no": trade_id,
        }));
        let signed = self.signed_request(method::CANCEL, &biz, ctx, &[])?;
        self.dispatcher.dispatch(&signed, ctx).await?;
        Ok(())
    }
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("app_id", &self.config.app_id)
            .finish_non_exhaustive()
    }
}

/// Drops empty-string and null members from a JSON object so optional
/// fields never reach the wire.
fn prune_empty(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null() && v.as_str() != Some(""))
                .collect(),
        ),
        other => other,
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| GatewayError::Protocol(format!("unexpected payload shape: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_empty_drops_blank_members() {
        let pruned = prune_empty(json!({
            "keep": "value",
            "blank": "",
            "null": null,
            "number": 1,
        }));
        let map = pruned.as_object().unwrap();
        assert!(map.contains_key("keep"));
        assert!(map.contains_key("number"));
        assert!(!map.contains_key("blank"));
        assert!(!map.contains_key("null"));
    }

    #[test]
    fn test_decode_reports_shape_mismatch() {
        let result: Result<TokenPayload> = decode(json!({ "unexpected": true }));
        assert!(matches!(result, Err(GatewayError::Protocol(_))));
    }
}
