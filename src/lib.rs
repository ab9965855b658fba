//! Client integration for an RSA-signed payment gateway.
//!
//! The crate turns the gateway's quirky retry semantics into a small set of
//! safe workflows: front-end payment parameter generation, merchant-scans-
//! buyer payment with automatic poll-and-compensate, refunds under a
//! cumulative cap, status sync, and delegation (pay-on-behalf-of-merchant)
//! management.
//!
//! # Architecture
//!
//! - [`sign`] canonicalizes and signs request parameters (RSA PKCS#1 v1.5 +
//!   SHA-256, the provider's "RSA2").
//! - [`classify`] maps provider response codes onto retry advice and domain
//!   errors.
//! - [`dispatch`] runs the retry/poll/deadline state machine. One logical
//!   operation gets one deadline; retries never reset it.
//! - [`reconcile`] merges outcomes into local Trade/Refund rows, keeping
//!   one row per external order ID even under concurrent duplicates.
//! - [`auth`] resolves which merchant context an operation executes under
//!   (single-merchant or delegated sub-merchant).
//! - [`client`] composes the above into the public workflows.
//!
//! Persistence is abstracted behind the [`store`] traits; the bundled
//! [`store::MemoryLedger`] backs tests and prototypes.
//!
//! # Example
//!
//! ```no_run
//! use alipay_bridge::{GatewayClient, GatewayConfig, Ledger, PayKind, PayRequest};
//!
//! # async fn demo(config: GatewayConfig) -> alipay_bridge::Result<()> {
//! let client = GatewayClient::new(config, Ledger::in_memory())?;
//! let params = client
//!     .pay_params(&PayRequest {
//!         out_trade_id: "order-20240501-0001".to_owned(),
//!         amount: 8888,
//!         subject: "Coffee beans".to_owned(),
//!         kind: PayKind::Web,
//!         ..PayRequest::default()
//!     })
//!     .await?;
//! println!("redirect the buyer with: {}", params.query);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod classify;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod reconcile;
pub mod sign;
pub mod store;
pub mod transport;
pub mod wire;

mod client;

pub use client::{
    AuthConfirm, BarPayRequest, CancelRequest, GatewayClient, PayParams, PayRequest,
    RefundRequest, TradeQuery,
};
pub use config::{DispatchConfig, GatewayConfig};
pub use error::{GatewayError, Result};
pub use model::{
    Auth, AuthStatus, CHANNEL, PayKind, Refund, RefundStatus, Trade, TradeStatus, User,
};
pub use store::{Ledger, MemoryLedger};
