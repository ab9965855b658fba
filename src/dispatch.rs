//! Request dispatch: the retry/poll/deadline state machine.
//!
//! One logical operation gets one [`RequestContext`] whose start time is set
//! at the first attempt and never reset by retries. The dispatcher walks a
//! bounded state machine whose live states are Attempting, RetryWait, and
//! Polling; the only terminal outcomes are a definite result or deadline
//! expiry. The response classifier advises the next transition on every
//! decoded response:
//!
//! - `Success`/`Stop` return immediately.
//! - `RetryImmediate` resends the identical signed payload after a short
//!   wait. The parameters are never mutated or re-signed; the signature
//!   covers the original set.
//! - `RetryPoll` stops resending and probes the order status on a fixed
//!   interval through the caller-supplied probe, until a terminal status or
//!   the deadline. Calls with no probe wired (refund, cancel, query) degrade
//!   to the short-wait resend.
//! - `ReauthRequired` returns at once; looping cannot make progress without
//!   external action.

use std::time::Duration;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::{
    classify::{self, Outcome},
    clock::Clock,
    config::DispatchConfig,
    error::{GatewayError, Result},
    model::Auth,
    transport::Transport,
    wire::{self, QueryPayload},
};

/// Per-operation state: deadline origin and resolved authorization.
///
/// Created fresh for every logical call and threaded by parameter. Never
/// store one on a long-lived client: concurrent operations would cross-talk
/// through the shared slot.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Start of the logical operation; the deadline is measured from here
    /// across all retries and polls.
    pub started_at: DateTime<Utc>,
    /// Authorization the operation executes under.
    pub auth: Auth,
}

impl RequestContext {
    /// Opens a context at the current time.
    pub fn begin(clock: &dyn Clock, auth: Auth) -> Self {
        Self { started_at: clock.now(), auth }
    }
}

/// One fully assembled, signed request.
///
/// The URL embeds the signed query string; resending it verbatim is what
/// makes `RetryImmediate` safe.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    /// Gateway method, for logging and the response key.
    pub method: String,
    /// Complete request URL including the signed query.
    pub url: String,
    /// Envelope key the response payload lives under.
    pub response_key: String,
}

impl SignedRequest {
    /// Assembles the request URL from the gateway base and a signed
    /// parameter set.
    #[must_use]
    pub fn new(
        gateway_url: &str,
        method: &str,
        params: &std::collections::BTreeMap<String, String>,
    ) -> Self {
        Self {
            method: method.to_owned(),
            url: format!("{gateway_url}?{}", wire::build_query(params)),
            response_key: wire::response_key(method),
        }
    }
}

/// Answer from one status probe during polling.
#[derive(Debug)]
pub enum PollVerdict {
    /// No terminal status yet; keep polling.
    Pending,
    /// The order reached success; polling ends with this payload.
    Succeeded(QueryPayload),
    /// The order reached a terminal non-success status; polling ends in
    /// failure.
    Failed,
}

/// Terminal result of a dispatch.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The request itself succeeded; the method payload follows.
    Payload(serde_json::Value),
    /// Success was observed through the poll loop instead of the original
    /// request.
    Polled(QueryPayload),
}

/// Live states of the dispatch machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Attempting,
    RetryWait,
    Polling,
}

/// Sends signed requests and applies the retry/poll/deadline policy.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Creates a dispatcher over a transport and clock.
    pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>, config: DispatchConfig) -> Self {
        Self { transport, clock, config }
    }

    fn elapsed(&self, ctx: &RequestContext) -> Duration {
        (self.clock.now() - ctx.started_at).to_std().unwrap_or(Duration::ZERO)
    }

    fn check_deadline(&self, ctx: &RequestContext) -> Result<()> {
        let elapsed = self.elapsed(ctx);
        if elapsed > self.config.deadline() {
            return Err(GatewayError::DeadlineExceeded { elapsed });
        }
        Ok(())
    }

    /// Dispatches a request with no status probe.
    ///
    /// `RetryPoll` outcomes degrade to the short-wait resend, which is the
    /// correct behavior for refund, cancel, query, and token calls.
    ///
    /// # Errors
    ///
    /// Returns the classified domain error on a terminal failure, or
    /// [`GatewayError::DeadlineExceeded`] once the operation deadline
    /// passes.
    pub async fn dispatch(
        &self,
        request: &SignedRequest,
        ctx: &RequestContext,
    ) -> Result<serde_json::Value> {
        type NeverPoll = fn() -> std::future::Ready<Result<PollVerdict>>;
        match self.run(request, ctx, None::<NeverPoll>).await? {
            DispatchOutcome::Payload(value) => Ok(value),
            // Unreachable without a probe; kept total instead of panicking.
            DispatchOutcome::Polled(_) => {
                Err(GatewayError::Protocol("poll outcome without a poll probe".to_owned()))
            }
        }
    }

    /// Dispatches a request with a status probe wired for `RetryPoll`.
    ///
    /// The probe is invoked once per poll interval and decides whether the
    /// order settled. Probe-level errors are logged and polling continues;
    /// only a verdict or the deadline ends the loop.
    ///
    /// # Errors
    ///
    /// As [`dispatch`](Self::dispatch); a `Failed` verdict surfaces the
    /// error classified from the response that started the poll.
    pub async fn dispatch_with_poll<F, Fut>(
        &self,
        request: &SignedRequest,
        ctx: &RequestContext,
        poll: F,
    ) -> Result<DispatchOutcome>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<PollVerdict>>,
    {
        self.run(request, ctx, Some(poll)).await
    }

    #[instrument(skip(self, ctx, poll), fields(method = %request.method))]
    async fn run<F, Fut>(
        &self,
        request: &SignedRequest,
        ctx: &RequestContext,
        mut poll: Option<F>,
    ) -> Result<DispatchOutcome>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<PollVerdict>>,
    {
        let mut state = DispatchState::Attempting;
        // Error classified from the response that moved us into Polling;
        // surfaced if the poll loop ends in failure.
        let mut pending_error: Option<GatewayError> = None;

        loop {
            self.check_deadline(ctx)?;
            match state {
                DispatchState::Attempting => {
                    let body = match self.transport.fetch(&request.url).await {
                        Ok(body) => body,
                        Err(error) => {
                            warn!(error = %error, "transport fault, will resend");
                            state = DispatchState::RetryWait;
                            continue;
                        }
                    };
                    let payload = wire::unwrap_envelope(&body, &request.response_key)?;
                    let classification =
                        classify::classify(&payload.code, payload.sub_code.as_deref());
                    debug!(code = %payload.code, outcome = ?classification.outcome, "response classified");
                    match classification.outcome {
                        Outcome::Success => return Ok(DispatchOutcome::Payload(payload.body)),
                        Outcome::Stop | Outcome::ReauthRequired => {
                            return Err(classification.error.unwrap_or_else(|| {
                                GatewayError::Protocol(
                                    "terminal response without an error code".to_owned(),
                                )
                            }));
                        }
                        Outcome::RetryImmediate => state = DispatchState::RetryWait,
                        Outcome::RetryPoll => {
                            if poll.is_some() {
                                pending_error = classification.error;
                                state = DispatchState::Polling;
                            } else {
                                state = DispatchState::RetryWait;
                            }
                        }
                    }
                }
                DispatchState::RetryWait => {
                    self.clock.sleep(self.config.retry_wait()).await;
                    state = DispatchState::Attempting;
                }
                DispatchState::Polling => {
                    self.clock.sleep(self.config.poll_interval()).await;
                    self.check_deadline(ctx)?;
                    let Some(probe) = poll.as_mut() else {
                        state = DispatchState::RetryWait;
                        continue;
                    };
                    match probe().await {
                        Ok(PollVerdict::Succeeded(payload)) => {
                            return Ok(DispatchOutcome::Polled(payload));
                        }
                        Ok(PollVerdict::Pending) => {}
                        Ok(PollVerdict::Failed) => {
                            return Err(pending_error.take().unwrap_or(GatewayError::Provider {
                                code: "10003".to_owned(),
                                sub_code: String::new(),
                            }));
                        }
                        Err(error) => {
                            warn!(error = %error, "status probe failed, polling continues");
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("config", &self.config).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::{clock::ManualClock, model::Auth};

    /// Transport that replays a script of bodies/errors and records every
    /// fetched URL.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<String>>>,
        urls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<String>>) -> Self {
            Self { script: Mutex::new(script.into()), urls: Mutex::new(Vec::new()) }
        }

        fn calls(&self) -> usize {
            self.urls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn fetch(&self, url: &str) -> Result<String> {
            self.urls.lock().unwrap().push(url.to_owned());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GatewayError::Protocol("script exhausted".to_owned())))
        }
    }

    fn response(code: &str) -> Result<String> {
        Ok(format!(r#"{{"alipay_trade_pay_response":{{"code":"{code}","trade_no":"T1"}}}}"#))
    }

    fn fixture(
        script: Vec<Result<String>>,
    ) -> (Arc<ScriptedTransport>, Dispatcher, RequestContext, SignedRequest) {
        let transport = Arc::new(ScriptedTransport::new(script));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let dispatcher =
            Dispatcher::new(transport.clone(), clock.clone(), DispatchConfig::default());
        let ctx = RequestContext::begin(clock.as_ref(), Auth::single_merchant("m1"));
        let request = SignedRequest {
            method: "alipay.trade.pay".to_owned(),
            url: "https://gateway.test/gateway.do?signed=1".to_owned(),
            response_key: "alipay_trade_pay_response".to_owned(),
        };
        (transport, dispatcher, ctx, request)
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let (transport, dispatcher, ctx, request) = fixture(vec![response("10000")]);
        let value = dispatcher.dispatch(&request, &ctx).await.unwrap();
        assert_eq!(value["trade_no"], "T1");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_retry_immediate_resends_identical_request() {
        let (transport, dispatcher, ctx, request) =
            fixture(vec![response("20000"), response("10000")]);
        dispatcher.dispatch(&request, &ctx).await.unwrap();
        let urls = transport.urls.lock().unwrap().clone();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0], urls[1]);
    }

    #[tokio::test]
    async fn test_transport_fault_retries_until_success() {
        let (transport, dispatcher, ctx, request) = fixture(vec![
            Err(GatewayError::Protocol("connection reset".to_owned())),
            response("10000"),
        ]);
        dispatcher.dispatch(&request, &ctx).await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_stop_code_returns_domain_error() {
        let (_, dispatcher, ctx, request) = fixture(vec![Ok(
            r#"{"alipay_trade_pay_response":{"code":"40004","sub_code":"ACQ.TRADE_NOT_EXIST"}}"#
                .to_owned(),
        )]);
        let result = dispatcher.dispatch(&request, &ctx).await;
        assert!(matches!(result, Err(GatewayError::TradeNotFound)));
    }

    #[tokio::test]
    async fn test_reauth_returns_immediately_without_retry() {
        let (transport, dispatcher, ctx, request) = fixture(vec![response("20001")]);
        let result = dispatcher.dispatch(&request, &ctx).await;
        assert!(matches!(result, Err(GatewayError::Authorization)));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_deadline_bounds_transport_retries() {
        // Script is empty, so every fetch fails; the manual clock advances
        // one retry wait per attempt until the deadline trips.
        let (transport, dispatcher, ctx, request) = fixture(vec![]);
        let result = dispatcher.dispatch(&request, &ctx).await;
        assert!(matches!(result, Err(GatewayError::DeadlineExceeded { .. })));
        // deadline 600s / 1s retry wait
        assert_eq!(transport.calls(), 601);
    }

    #[tokio::test]
    async fn test_poll_until_succeeded() {
        let (transport, dispatcher, ctx, request) = fixture(vec![response("10003")]);
        let polls = Mutex::new(0usize);
        let outcome = dispatcher
            .dispatch_with_poll(&request, &ctx, || async {
                let mut count = polls.lock().unwrap();
                *count += 1;
                if *count < 3 {
                    Ok(PollVerdict::Pending)
                } else {
                    Ok(PollVerdict::Succeeded(QueryPayload {
                        trade_no: "T1".to_owned(),
                        out_trade_no: String::new(),
                        trade_status: "TRADE_SUCCESS".to_owned(),
                        total_amount: "1.00".to_owned(),
                        send_pay_date: None,
                    }))
                }
            })
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Polled(_)));
        assert_eq!(*polls.lock().unwrap(), 3);
        // Only the original request hit the wire; polling went through the
        // probe, not through resends.
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_poll_respects_deadline() {
        let (_, dispatcher, ctx, request) = fixture(vec![response("10003")]);
        let polls = Mutex::new(0usize);
        let result = dispatcher
            .dispatch_with_poll(&request, &ctx, || async {
                *polls.lock().unwrap() += 1;
                Ok(PollVerdict::Pending)
            })
            .await;
        assert!(matches!(result, Err(GatewayError::DeadlineExceeded { .. })));
        // deadline 600s / 3s poll interval: probes run until the clock
        // passes the deadline, never faster than the interval.
        assert_eq!(*polls.lock().unwrap(), 200);
    }

    #[tokio::test]
    async fn test_poll_failed_surfaces_classified_error() {
        let (_, dispatcher, ctx, request) = fixture(vec![Ok(
            r#"{"alipay_trade_pay_response":{"code":"10003","sub_code":"ACQ.SYSTEM_ERROR"}}"#
                .to_owned(),
        )]);
        let result = dispatcher
            .dispatch_with_poll(&request, &ctx, || async { Ok(PollVerdict::Failed) })
            .await;
        assert!(matches!(result, Err(GatewayError::Provider { .. })));
    }

    #[tokio::test]
    async fn test_retry_poll_without_probe_degrades_to_resend() {
        let (transport, dispatcher, ctx, request) =
            fixture(vec![response("10003"), response("10000")]);
        dispatcher.dispatch(&request, &ctx).await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_terminal() {
        let (transport, dispatcher, ctx, request) =
            fixture(vec![Ok(r#"{"wrong_key":{}}"#.to_owned())]);
        let result = dispatcher.dispatch(&request, &ctx).await;
        assert!(matches!(result, Err(GatewayError::Protocol(_))));
        assert_eq!(transport.calls(), 1);
    }
}
