use crate::config::WithdrawalMode;
use crate::error::ServiceError;
use crate::gateway::PaymentRequest;
use crate::{AppState, Store};
use aviator_execution::{deposit_reference, withdrawal_reference, PaymentError};
use aviator_types::{
    normalize_phone, AccountId, Amount, AutoplayConfig, GatewayCallback, Multiplier, NewAccount,
    PanelId, RoundNumber, Stake, Transaction, Withdrawal, WithdrawalId, PAYMENT_RETRY_REASON,
};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;
const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Run a synchronous ledger call off the async workers.
async fn blocking<T, E>(op: impl FnOnce() -> Result<T, E> + Send + 'static) -> Result<T, ServiceError>
where
    T: Send + 'static,
    E: Into<ServiceError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| ServiceError::Internal(err.to_string()))?
        .map_err(Into::into)
}

fn check_admin<L>(state: &AppState<L>, headers: &HeaderMap) -> Result<(), ServiceError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    if provided != Some(expected) {
        return Err(ServiceError::Unauthorized);
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
}

impl PageQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
    }
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn open_account<L: Store>(
    State(state): State<AppState<L>>,
    Json(mut account): Json<NewAccount>,
) -> Result<impl IntoResponse, ServiceError> {
    account.phone_number = account
        .phone_number
        .as_deref()
        .map(normalize_phone)
        .transpose()?;
    let now = state.now_ms();
    let ledger = state.ledger.clone();
    let account = blocking(move || ledger.open_account(account, now)).await?;
    info!(account = %account.id, referrer = ?account.referrer_id, "account opened");
    Ok((StatusCode::CREATED, Json(account)))
}

pub async fn get_account<L: Store>(
    State(state): State<AppState<L>>,
    Path(id): Path<AccountId>,
) -> Result<impl IntoResponse, ServiceError> {
    let ledger = state.ledger.clone();
    let account = blocking(move || ledger.account(&id)).await?;
    Ok(Json(account))
}

pub async fn transactions<L: Store>(
    State(state): State<AppState<L>>,
    Path(id): Path<AccountId>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<Transaction>>, ServiceError> {
    let ledger = state.ledger.clone();
    let limit = page.limit();
    let txns = blocking(move || {
        ledger.account(&id)?;
        ledger.transactions(&id, limit)
    })
    .await?;
    Ok(Json(txns))
}

pub async fn bet_history<L: Store>(
    State(state): State<AppState<L>>,
    Path(id): Path<AccountId>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let ledger = state.ledger.clone();
    let limit = page.limit();
    let bets = blocking(move || {
        ledger.account(&id)?;
        ledger.bet_history(&id, limit)
    })
    .await?;
    Ok(Json(bets))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetRequest {
    pub account_id: AccountId,
    #[serde(default)]
    pub panel_id: PanelId,
    pub amount: Amount,
    #[serde(default)]
    pub auto_cashout: Option<Multiplier>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BetResponse {
    pub stake: Stake,
    pub balance: Amount,
}

pub async fn place_bet<L: Store>(
    State(state): State<AppState<L>>,
    Json(request): Json<BetRequest>,
) -> Result<Json<BetResponse>, ServiceError> {
    let placed = state
        .rounds
        .place_bet(
            &request.account_id,
            request.panel_id,
            request.amount,
            request.auto_cashout,
        )
        .await??;
    Ok(Json(BetResponse {
        stake: placed.stake,
        balance: placed.balance,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashoutRequest {
    pub account_id: AccountId,
    #[serde(default)]
    pub panel_id: PanelId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CashoutResponse {
    pub round_number: RoundNumber,
    pub panel_id: PanelId,
    pub multiplier: Multiplier,
    pub payout: Amount,
    pub balance: Amount,
}

pub async fn cash_out<L: Store>(
    State(state): State<AppState<L>>,
    Json(request): Json<CashoutRequest>,
) -> Result<Json<CashoutResponse>, ServiceError> {
    let cashout = state
        .rounds
        .cash_out(&request.account_id, request.panel_id)
        .await??;
    Ok(Json(CashoutResponse {
        round_number: cashout.round_number,
        panel_id: cashout.panel_id,
        multiplier: cashout.multiplier,
        payout: cashout.payout,
        balance: cashout.balance,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoplayRequest {
    pub account_id: AccountId,
    #[serde(default)]
    pub panel_id: PanelId,
    #[serde(flatten)]
    pub config: AutoplayConfig,
}

pub async fn autoplay<L: Store>(
    State(state): State<AppState<L>>,
    Json(request): Json<AutoplayRequest>,
) -> Result<StatusCode, ServiceError> {
    let enabled = request.config.enabled;
    state
        .rounds
        .set_autoplay(&request.account_id, request.panel_id, request.config)
        .await??;
    debug!(account = %request.account_id, panel = request.panel_id, enabled, "autoplay updated");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn current_round<L: Store>(State(state): State<AppState<L>>) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(state.rounds.snapshot().await?))
}

pub async fn round_history<L: Store>(State(state): State<AppState<L>>) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(state.rounds.history().await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentBody {
    pub account_id: AccountId,
    pub amount: Amount,
    pub phone_number: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositResponse {
    /// Our reference, set before the gateway was contacted.
    pub reference: String,
    /// The id the gateway returned for the request.
    pub correlation_id: String,
    pub transaction: Transaction,
}

pub async fn deposit<L: Store>(
    State(state): State<AppState<L>>,
    Json(body): Json<PaymentBody>,
) -> Result<impl IntoResponse, ServiceError> {
    let reconciler = state.reconciler.clone();
    let intent = blocking(move || reconciler.prepare_deposit(&body.account_id, body.amount, &body.phone_number)).await?;

    let reference = deposit_reference(Uuid::new_v4());
    let request = PaymentRequest {
        phone_number: intent.phone_number.clone(),
        amount: intent.amount,
        reference: reference.clone(),
    };
    let reconciler = state.reconciler.clone();
    let now = state.now_ms();
    let key = reference.clone();
    let pending = blocking(move || reconciler.record_deposit(&intent, &key, now)).await?;

    let correlation_id = match state.gateway.request_deposit(&request).await {
        Ok(correlation_id) => correlation_id,
        Err(err) => {
            warn!(account = %pending.account_id, amount = pending.amount, %err, "deposit request failed at gateway");
            let reconciler = state.reconciler.clone();
            let now = state.now_ms();
            let key = reference.clone();
            if let Err(err) = blocking(move || reconciler.abandon_deposit(&key, now)).await {
                error!(%reference, %err, "failed to abandon deposit after gateway failure");
            }
            return Err(PaymentError::GatewayFailed.into());
        }
    };

    link(&state, &reference, &correlation_id).await;
    // The callback may already have resolved it.
    let ledger = state.ledger.clone();
    let key = reference.clone();
    let transaction = blocking(move || ledger.transaction_by_ref(&key))
        .await?
        .unwrap_or(pending);
    Ok((
        StatusCode::ACCEPTED,
        Json(DepositResponse {
            reference,
            correlation_id,
            transaction,
        }),
    ))
}

/// Link the gateway's id to our reference. Callbacks that echo our reference
/// still match without it, so a failure here is only logged.
async fn link<L: Store>(state: &AppState<L>, reference: &str, correlation_id: &str) {
    let reconciler = state.reconciler.clone();
    let (key, correlation) = (reference.to_string(), correlation_id.to_string());
    if let Err(err) = blocking(move || reconciler.link_correlation(&key, &correlation)).await {
        warn!(reference, correlation = correlation_id, %err, "failed to link gateway correlation id");
    }
}

pub async fn request_withdrawal<L: Store>(
    State(state): State<AppState<L>>,
    Json(body): Json<PaymentBody>,
) -> Result<impl IntoResponse, ServiceError> {
    let registry = state.withdrawals.clone();
    let now = state.now_ms();
    let withdrawal =
        blocking(move || registry.request(&body.account_id, body.amount, &body.phone_number, now)).await?;
    if state.withdrawal_mode == WithdrawalMode::Manual {
        return Ok((StatusCode::CREATED, Json(withdrawal)));
    }

    let id = withdrawal.id;
    let reference = withdrawal_reference(id);
    let request = PaymentRequest {
        phone_number: withdrawal.phone_number.clone(),
        amount: withdrawal.amount,
        reference: reference.clone(),
    };
    let registry = state.withdrawals.clone();
    let key = reference.clone();
    let sent = match blocking(move || registry.attach_correlation(id, &key)).await {
        Ok(()) => state.gateway.request_payout(&request).await.map_err(|err| err.to_string()),
        Err(err) => Err(err.to_string()),
    };
    let registry = state.withdrawals.clone();
    match sent {
        Ok(correlation_id) => {
            link(&state, &reference, &correlation_id).await;
            let withdrawal = blocking(move || registry.get(id)).await?;
            info!(id, %reference, correlation = %correlation_id, "payout requested");
            Ok((StatusCode::CREATED, Json(withdrawal)))
        }
        Err(err) => {
            warn!(id, %err, "payout request not sent, refunding");
            let now = state.now_ms();
            if let Err(err) = blocking(move || registry.reject(id, PAYMENT_RETRY_REASON, now)).await {
                error!(id, %err, "failed to refund withdrawal after gateway failure");
            }
            Err(PaymentError::GatewayFailed.into())
        }
    }
}

pub async fn pending_withdrawals<L: Store>(
    State(state): State<AppState<L>>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<Withdrawal>>, ServiceError> {
    check_admin(&state, &headers)?;
    let registry = state.withdrawals.clone();
    let limit = page.limit();
    Ok(Json(blocking(move || registry.pending(limit)).await?))
}

pub async fn approve_withdrawal<L: Store>(
    State(state): State<AppState<L>>,
    headers: HeaderMap,
    Path(id): Path<WithdrawalId>,
) -> Result<Json<Withdrawal>, ServiceError> {
    check_admin(&state, &headers)?;
    let registry = state.withdrawals.clone();
    let now = state.now_ms();
    Ok(Json(blocking(move || registry.approve(id, now)).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectBody {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectResponse {
    pub withdrawal: Withdrawal,
    pub balance: Option<Amount>,
}

pub async fn reject_withdrawal<L: Store>(
    State(state): State<AppState<L>>,
    headers: HeaderMap,
    Path(id): Path<WithdrawalId>,
    Json(body): Json<RejectBody>,
) -> Result<Json<RejectResponse>, ServiceError> {
    check_admin(&state, &headers)?;
    let reason = match body.reason.trim() {
        "" => "rejected by admin".to_string(),
        reason => reason.to_string(),
    };
    let registry = state.withdrawals.clone();
    let now = state.now_ms();
    let (withdrawal, refund) = blocking(move || registry.reject(id, &reason, now)).await?;
    Ok(Json(RejectResponse {
        withdrawal,
        balance: refund.map(|applied| applied.balance),
    }))
}

#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackAck {
    pub result_code: i32,
}

/// The vendor retries until it sees `resultCode: 0`, so every parsed
/// callback is acknowledged, including replays and ones we fail to apply.
pub async fn payment_callback<L: Store>(
    State(state): State<AppState<L>>,
    Json(callback): Json<GatewayCallback>,
) -> Json<CallbackAck> {
    let correlation_id = callback.correlation_id.clone();
    let reconciler = state.reconciler.clone();
    let now = state.now_ms();
    match blocking(move || reconciler.handle_callback(&callback, now)).await {
        Ok(outcome) => debug!(correlation = %correlation_id, applied = outcome.applied(), "payment callback handled"),
        Err(err) => error!(correlation = %correlation_id, %err, "failed to apply payment callback"),
    }
    Json(CallbackAck { result_code: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::SystemClock;
    use crate::config::Config;
    use crate::gateway::{GatewayError, PaymentGateway, SandboxGateway};
    use crate::start;
    use aviator_execution::mocks::{callback, funded_ledger};
    use aviator_execution::{Ledger, MemoryLedger, PaymentLimits, PaymentReconciler};
    use aviator_types::{TransactionStatus, WithdrawalStatus, RESULT_SUCCESS};
    use axum::http::HeaderValue;
    use axum::response::Response;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use serde_json::Value;
    use std::sync::Arc;

    /// A gateway whose callback for our reference lands before the request
    /// returns its own id.
    struct CallsBackFirst {
        reconciler: PaymentReconciler<MemoryLedger>,
        result_code: i32,
    }

    impl CallsBackFirst {
        fn respond(&self, request: &PaymentRequest) -> Result<String, GatewayError> {
            let outcome = self
                .reconciler
                .handle_callback(&callback(&request.reference, self.result_code, Some(request.amount)), 0)
                .map_err(|_| GatewayError::Unavailable)?;
            assert!(outcome.applied(), "callback found nothing for {}", request.reference);
            Ok("vendor-1".to_string())
        }
    }

    impl PaymentGateway for CallsBackFirst {
        fn request_deposit<'a>(&'a self, request: &'a PaymentRequest) -> BoxFuture<'a, Result<String, GatewayError>> {
            futures_util::future::ready(self.respond(request)).boxed()
        }

        fn request_payout<'a>(&'a self, request: &'a PaymentRequest) -> BoxFuture<'a, Result<String, GatewayError>> {
            futures_util::future::ready(self.respond(request)).boxed()
        }
    }

    struct Harness {
        state: AppState<MemoryLedger>,
        gateway: Arc<SandboxGateway>,
    }

    fn config(mode: WithdrawalMode) -> crate::config::ValidatedConfig {
        Config {
            betting_ms: 60_000,
            withdrawal_mode: mode,
            admin_token: Some("let-me-in".to_string()),
            ..Config::default()
        }
        .validate()
        .unwrap()
    }

    fn harness(mode: WithdrawalMode) -> Harness {
        let ledger = funded_ledger(&[("alice", 1_000), ("bob", 0)]);
        let gateway = Arc::new(SandboxGateway::new());
        let (state, _actor) = start(ledger, &config(mode), gateway.clone(), Arc::new(SystemClock)).unwrap();
        Harness { state, gateway }
    }

    fn calls_back_first(mode: WithdrawalMode, result_code: i32) -> AppState<MemoryLedger> {
        let ledger = funded_ledger(&[("alice", 1_000), ("bob", 0)]);
        let gateway = Arc::new(CallsBackFirst {
            reconciler: PaymentReconciler::new(ledger.clone(), PaymentLimits::default()),
            result_code,
        });
        let (state, _actor) = start(ledger, &config(mode), gateway, Arc::new(SystemClock)).unwrap();
        state
    }

    fn admin_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_TOKEN_HEADER, HeaderValue::from_static("let-me-in"));
        headers
    }

    async fn read(response: Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn read_result<T: IntoResponse>(result: Result<T, ServiceError>) -> (StatusCode, Value) {
        read(result.into_response()).await
    }

    fn payment(account: &str, amount: Amount) -> Json<PaymentBody> {
        Json(PaymentBody {
            account_id: account.to_string(),
            amount,
            phone_number: "0712 345 678".to_string(),
        })
    }

    #[tokio::test]
    async fn test_open_account_normalizes_phone() {
        let h = harness(WithdrawalMode::Manual);
        let request = NewAccount {
            id: "carol".to_string(),
            phone_number: Some("+254 712-345-678".to_string()),
            ..Default::default()
        };
        let (status, body) = read_result(open_account(State(h.state.clone()), Json(request.clone())).await).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["phoneNumber"], "254712345678");
        assert_eq!(body["balance"], 0);

        let (status, body) = read_result(open_account(State(h.state.clone()), Json(request)).await).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "ACCOUNT_EXISTS");

        let (status, body) = read_result(get_account(State(h.state.clone()), Path("nobody".to_string())).await).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "ACCOUNT_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_bet_debits_and_rejects_overdraw() {
        let h = harness(WithdrawalMode::Manual);
        let bet = |amount| {
            Json(BetRequest {
                account_id: "alice".to_string(),
                panel_id: 0,
                amount,
                auto_cashout: None,
            })
        };
        let placed = place_bet(State(h.state.clone()), bet(400)).await.unwrap();
        assert_eq!(placed.balance, 600);
        assert_eq!(placed.stake.amount, 400);

        let (status, body) = read_result(place_bet(State(h.state.clone()), bet(100)).await).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "STAKE_EXISTS");

        let overdraw = Json(BetRequest {
            account_id: "alice".to_string(),
            panel_id: 1,
            amount: 5_000,
            auto_cashout: None,
        });
        let (status, body) = read_result(place_bet(State(h.state.clone()), overdraw).await).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INSUFFICIENT_FUNDS");
        assert_eq!(h.state.ledger.account("alice").unwrap().balance, 600);

        let snapshot = h.state.rounds.snapshot().await.unwrap();
        assert_eq!(snapshot.stakes.len(), 1);
        assert_eq!(snapshot.crash_point, None);
    }

    #[tokio::test]
    async fn test_cash_out_during_betting_is_rejected() {
        let h = harness(WithdrawalMode::Manual);
        let request = Json(CashoutRequest {
            account_id: "alice".to_string(),
            panel_id: 0,
        });
        let (status, body) = read_result(cash_out(State(h.state.clone()), request).await).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "INVALID_PHASE");
    }

    #[tokio::test]
    async fn test_deposit_then_callback_credits_once() {
        let h = harness(WithdrawalMode::Manual);
        let (status, body) = read_result(deposit(State(h.state.clone()), payment("bob", 500)).await).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["transaction"]["status"], "pending");
        let reference = body["reference"].as_str().unwrap().to_string();
        let correlation = body["correlationId"].as_str().unwrap().to_string();
        assert!(reference.starts_with("deposit-"));

        let issued = h.gateway.issued();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].request.phone_number, "254712345678");
        assert_eq!(issued[0].request.reference, reference);
        assert_eq!(issued[0].correlation_id, correlation);
        assert_eq!(h.state.ledger.account("bob").unwrap().balance, 0);

        for id in [&correlation, &reference] {
            let ack = payment_callback(State(h.state.clone()), Json(callback(id, 0, Some(500)))).await;
            assert_eq!(ack.0, CallbackAck { result_code: 0 });
        }
        assert_eq!(h.state.ledger.account("bob").unwrap().balance, 500);
        let txn = h.state.ledger.transaction_by_ref(&reference).unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_deposit_gateway_failure_fails_the_pending_deposit() {
        let h = harness(WithdrawalMode::Manual);
        h.gateway.set_failing(true);
        let (status, body) = read_result(deposit(State(h.state.clone()), payment("bob", 500)).await).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "PAYMENT_FAILED");
        let txns = h.state.ledger.transactions("bob", 10).unwrap();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].status, TransactionStatus::Failed);
        assert_eq!(h.state.ledger.account("bob").unwrap().balance, 0);
    }

    #[tokio::test]
    async fn test_deposit_callback_before_gateway_returns() {
        let state = calls_back_first(WithdrawalMode::Manual, RESULT_SUCCESS);
        let (status, body) = read_result(deposit(State(state.clone()), payment("bob", 500)).await).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["correlationId"], "vendor-1");
        assert_eq!(body["transaction"]["status"], "completed");
        assert_eq!(state.ledger.account("bob").unwrap().balance, 500);

        let replay = payment_callback(State(state.clone()), Json(callback("vendor-1", 0, Some(500)))).await;
        assert_eq!(replay.0.result_code, 0);
        assert_eq!(state.ledger.account("bob").unwrap().balance, 500);
    }

    #[tokio::test]
    async fn test_deposit_limits_checked_before_gateway() {
        let h = harness(WithdrawalMode::Manual);
        let (status, body) = read_result(deposit(State(h.state.clone()), payment("bob", 1)).await).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BELOW_MINIMUM");
        assert!(h.gateway.issued().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_callback_is_acknowledged() {
        let h = harness(WithdrawalMode::Manual);
        let ack = payment_callback(State(h.state.clone()), Json(callback("nope", 0, None))).await;
        assert_eq!(ack.0.result_code, 0);
    }

    #[tokio::test]
    async fn test_manual_withdrawal_needs_admin() {
        let h = harness(WithdrawalMode::Manual);
        let (status, body) = read_result(request_withdrawal(State(h.state.clone()), payment("alice", 300)).await).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "pending");
        let id = body["id"].as_u64().unwrap();
        assert_eq!(h.state.ledger.account("alice").unwrap().balance, 700);
        assert!(h.gateway.issued().is_empty());

        let denied = approve_withdrawal(State(h.state.clone()), HeaderMap::new(), Path(id)).await;
        assert!(matches!(denied, Err(ServiceError::Unauthorized)));

        let pending = pending_withdrawals(State(h.state.clone()), admin_headers(), Query(PageQuery::default()))
            .await
            .unwrap();
        assert_eq!(pending.0.len(), 1);

        let rejected = reject_withdrawal(
            State(h.state.clone()),
            admin_headers(),
            Path(id),
            Json(RejectBody::default()),
        )
        .await
        .unwrap();
        assert_eq!(rejected.0.withdrawal.status, WithdrawalStatus::Rejected);
        assert_eq!(rejected.0.balance, Some(1_000));

        let (status, body) = read_result(approve_withdrawal(State(h.state.clone()), admin_headers(), Path(id)).await).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "ALREADY_RESOLVED");
    }

    #[tokio::test]
    async fn test_gateway_withdrawal_refunds_on_failure() {
        let h = harness(WithdrawalMode::Gateway);
        h.gateway.set_failing(true);
        let (status, body) = read_result(request_withdrawal(State(h.state.clone()), payment("alice", 300)).await).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["message"], PAYMENT_RETRY_REASON);
        assert_eq!(h.state.ledger.account("alice").unwrap().balance, 1_000);
        let withdrawal = h.state.withdrawals.get(1).unwrap();
        assert_eq!(withdrawal.status, WithdrawalStatus::Rejected);
        assert_eq!(withdrawal.rejection_reason.as_deref(), Some(PAYMENT_RETRY_REASON));
    }

    #[tokio::test]
    async fn test_gateway_withdrawal_settles_by_callback() {
        let h = harness(WithdrawalMode::Gateway);
        let (status, body) = read_result(request_withdrawal(State(h.state.clone()), payment("alice", 300)).await).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["correlationId"], "withdrawal-1");
        let issued = h.gateway.issued();
        assert_eq!(issued[0].kind, crate::gateway::PaymentKind::Payout);
        assert_eq!(issued[0].request.reference, "withdrawal-1");

        payment_callback(State(h.state.clone()), Json(callback(&issued[0].correlation_id, 1032, None))).await;
        let withdrawal = h.state.withdrawals.get(body["id"].as_u64().unwrap()).unwrap();
        assert_eq!(withdrawal.status, WithdrawalStatus::Rejected);
        assert_eq!(h.state.ledger.account("alice").unwrap().balance, 1_000);

        payment_callback(State(h.state.clone()), Json(callback("withdrawal-1", 0, None))).await;
        assert_eq!(h.state.withdrawals.get(1).unwrap().status, WithdrawalStatus::Rejected);
    }

    #[tokio::test]
    async fn test_payout_callback_before_gateway_returns() {
        let state = calls_back_first(WithdrawalMode::Gateway, RESULT_SUCCESS);
        let (status, body) = read_result(request_withdrawal(State(state.clone()), payment("alice", 300)).await).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "completed");
        assert_eq!(state.ledger.account("alice").unwrap().balance, 700);

        // A late admin reject cannot refund a payout the gateway confirmed.
        let (status, body) = read_result(
            reject_withdrawal(State(state.clone()), admin_headers(), Path(1), Json(RejectBody::default())).await,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "ALREADY_RESOLVED");
        assert_eq!(state.ledger.account("alice").unwrap().balance, 700);
    }

    #[tokio::test]
    async fn test_manual_withdrawal_ignores_payment_callbacks() {
        let h = harness(WithdrawalMode::Manual);
        request_withdrawal(State(h.state.clone()), payment("alice", 300)).await.unwrap();
        let ack = payment_callback(State(h.state.clone()), Json(callback("withdrawal-1", 0, None))).await;
        assert_eq!(ack.0.result_code, 0);
        assert_eq!(h.state.withdrawals.get(1).unwrap().status, WithdrawalStatus::Pending);
    }

    #[test]
    fn test_page_limit_is_clamped() {
        assert_eq!(PageQuery { limit: None }.limit(), DEFAULT_PAGE);
        assert_eq!(PageQuery { limit: Some(0) }.limit(), 1);
        assert_eq!(PageQuery { limit: Some(10_000) }.limit(), MAX_PAGE);
    }
}
