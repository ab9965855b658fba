//! Wire protocol: envelope assembly, query-string encoding, and
//! envelope unwrapping.
//!
//! Every call carries the same envelope fields plus a JSON `biz_content`
//! payload; the response nests the method payload under a fixed
//! `<method>_response` key with `code`/`sub_code` inside. Responses are
//! decoded through one generic unwrap step and then into typed payload
//! structs per method, never through free-form maps.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::{
    error::{GatewayError, Result},
    model::TradeStatus,
};

/// Envelope `format` field.
pub const FORMAT: &str = "JSON";
/// Envelope `charset` field.
pub const CHARSET: &str = "utf-8";
/// Envelope `sign_type` field, the provider's tag for RSA PKCS#1 v1.5 +
/// SHA-256.
pub const SIGN_TYPE: &str = "RSA2";
/// Envelope `version` field.
pub const VERSION: &str = "1.0";

/// Wire timestamp layout used by both requests and responses.
pub const TIME_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

/// Gateway method names.
pub mod method {
    /// Desktop web redirect payment.
    pub const PAGE_PAY: &str = "alipay.trade.page.pay";
    /// In-app payment.
    pub const APP_PAY: &str = "alipay.trade.app.pay";
    /// Merchant-scans-buyer bar code payment.
    pub const PAY: &str = "alipay.trade.pay";
    /// Refund against a paid trade.
    pub const REFUND: &str = "alipay.trade.refund";
    /// Cancel an unpaid or ambiguous trade.
    pub const CANCEL: &str = "alipay.trade.cancel";
    /// Query trade status.
    pub const QUERY: &str = "alipay.trade.query";
    /// Exchange a one-time auth code for a delegation token.
    pub const TOKEN: &str = "alipay.open.auth.token.app";
}

/// Builds the shared envelope parameters for one request.
pub fn sys_params(app_id: &str, now: DateTime<Utc>) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app_id".to_owned(), app_id.to_owned()),
        ("format".to_owned(), FORMAT.to_owned()),
        ("charset".to_owned(), CHARSET.to_owned()),
        ("sign_type".to_owned(), SIGN_TYPE.to_owned()),
        ("version".to_owned(), VERSION.to_owned()),
        ("timestamp".to_owned(), now.format(TIME_LAYOUT).to_string()),
    ])
}

/// URL-encodes a parameter map into a query string.
#[must_use]
pub fn build_query(params: &BTreeMap<String, String>) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish()
}

/// Top-level response key for a method, e.g. `alipay.trade.pay` ->
/// `alipay_trade_pay_response`.
#[must_use]
pub fn response_key(method: &str) -> String {
    format!("{}_response", method.replace('.', "_"))
}

/// The method payload extracted from one response envelope.
#[derive(Debug)]
pub struct EnvelopePayload {
    /// Top-level provider response code.
    pub code: String,
    /// Provider sub-code when present.
    pub sub_code: Option<String>,
    /// Raw method payload, decoded further per method on success.
    pub body: serde_json::Value,
}

/// Unwraps a response body: parses JSON, extracts the method payload by its
/// known key, and pulls out the response codes.
///
/// # Errors
///
/// Returns [`GatewayError::Protocol`] when the body is not JSON, the key is
/// absent, or the payload carries no `code`.
pub fn unwrap_envelope(body: &str, key: &str) -> Result<EnvelopePayload> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| GatewayError::Protocol(format!("response is not valid JSON: {e}")))?;
    let payload = value
        .get(key)
        .ok_or_else(|| GatewayError::Protocol(format!("response key {key} is missing")))?;
    if !payload.is_object() {
        return Err(GatewayError::Protocol(format!("response key {key} is not an object")));
    }
    let code = payload
        .get("code")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| GatewayError::Protocol("response payload carries no code".to_owned()))?
        .to_owned();
    let sub_code = payload
        .get("sub_code")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned);
    Ok(EnvelopePayload { code, sub_code, body: payload.clone() })
}

/// Success payload of `alipay.trade.pay`.
#[derive(Debug, Deserialize)]
pub struct PayPayload {
    /// Provider-assigned trade ID.
    pub trade_no: String,
    /// Echo of the external order ID.
    #[serde(default)]
    pub out_trade_no: String,
    /// Paid amount in decimal currency units, as a string.
    #[serde(default)]
    pub total_amount: Option<String>,
    /// Payment completion time in wire layout.
    #[serde(default)]
    pub gmt_payment: Option<String>,
}

/// Success payload of `alipay.trade.query`.
#[derive(Debug, Deserialize)]
pub struct QueryPayload {
    /// Provider-assigned trade ID.
    pub trade_no: String,
    /// Echo of the external order ID.
    #[serde(default)]
    pub out_trade_no: String,
    /// Remote trade status tag.
    pub trade_status: String,
    /// Trade amount in decimal currency units, as a string.
    pub total_amount: String,
    /// Payment completion time in wire layout, absent until paid.
    #[serde(default)]
    pub send_pay_date: Option<String>,
}

/// Success payload of `alipay.trade.refund`.
#[derive(Debug, Deserialize)]
pub struct RefundPayload {
    /// Provider-assigned trade ID of the refunded trade.
    pub trade_no: String,
}

/// Success payload of `alipay.open.auth.token.app`.
#[derive(Debug, Deserialize)]
pub struct TokenPayload {
    /// Provider-assigned merchant identifier the grant applies to.
    pub user_id: String,
    /// The delegation token. Replaces any previous token for the merchant.
    pub app_auth_token: String,
}

/// Maps a remote trade status tag to the local status enum.
#[must_use]
pub fn trade_status_from_remote(tag: &str) -> Option<TradeStatus> {
    match tag {
        "WAIT_BUYER_PAY" => Some(TradeStatus::WaitPay),
        "TRADE_CLOSED" => Some(TradeStatus::Closed),
        "TRADE_SUCCESS" | "TRADE_FINISHED" => Some(TradeStatus::Success),
        _ => None,
    }
}

/// Converts a decimal-currency wire amount (e.g. `"88.88"`) to minor units.
///
/// # Errors
///
/// Returns [`GatewayError::Protocol`] on a non-numeric amount.
pub fn minor_units_from_wire(amount: &str) -> Result<i64> {
    let yuan: f64 = amount
        .parse()
        .map_err(|_| GatewayError::Protocol(format!("unparseable amount {amount:?}")))?;
    Ok((yuan * 100.0).round() as i64)
}

/// Converts minor units to the decimal-currency wire representation.
#[must_use]
pub fn wire_amount(minor_units: i64) -> String {
    format!("{}.{:02}", minor_units / 100, (minor_units % 100).abs())
}

/// Parses a wire timestamp into UTC.
#[must_use]
pub fn parse_wire_time(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, TIME_LAYOUT)
        .ok()
        .map(|naive| naive.and_utc())
}
