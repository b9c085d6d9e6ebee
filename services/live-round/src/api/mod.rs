use crate::{AppState, Store};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub mod http;
pub mod ws;

pub fn router<L: Store>(state: AppState<L>) -> Router {
    Router::new()
        .route("/healthz", get(http::healthz))
        .route("/ws", get(ws::ws_handler::<L>))
        .route("/accounts", post(http::open_account::<L>))
        .route("/accounts/:id", get(http::get_account::<L>))
        .route("/accounts/:id/transactions", get(http::transactions::<L>))
        .route("/accounts/:id/bets", get(http::bet_history::<L>))
        .route("/bets", post(http::place_bet::<L>))
        .route("/cashout", post(http::cash_out::<L>))
        .route("/autoplay", post(http::autoplay::<L>))
        .route("/rounds/current", get(http::current_round::<L>))
        .route("/rounds/history", get(http::round_history::<L>))
        .route("/deposits", post(http::deposit::<L>))
        .route("/withdrawals", post(http::request_withdrawal::<L>))
        .route("/admin/withdrawals", get(http::pending_withdrawals::<L>))
        .route(
            "/admin/withdrawals/:id/approve",
            post(http::approve_withdrawal::<L>),
        )
        .route(
            "/admin/withdrawals/:id/reject",
            post(http::reject_withdrawal::<L>),
        )
        .route("/callbacks/payment", post(http::payment_callback::<L>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
