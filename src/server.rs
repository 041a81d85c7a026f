// HTTP surface: checkout creation, session lookup, Stripe webhook, static assets

use crate::checkout::{CheckoutError, CheckoutRequest, CheckoutService};
use crate::reconcile::{Reconciler, WebhookOutcome};
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub checkout: CheckoutService,
    pub reconciler: Arc<Reconciler>,
}

impl IntoResponse for CheckoutError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState, public_dir: &str) -> Router {
    Router::new()
        .route("/create-checkout-session", post(create_checkout_session))
        .route("/checkout-session/:id", get(get_checkout_session))
        .route("/webhook", post(handle_stripe_webhook))
        .route("/health", get(health_check))
        .fallback_service(ServeDir::new(public_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server(port: u16, state: AppState, public_dir: &str) -> anyhow::Result<()> {
    let app = router(state, public_dir);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server running on http://localhost:{}", port);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn create_checkout_session(
    State(state): State<AppState>,
    body: Result<Json<CheckoutRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "Malformed checkout request");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": rejection.body_text() })),
            )
                .into_response();
        }
    };
    info!(items = request.items.len(), "Checkout requested");

    match state.checkout.start_checkout(&request.items).await {
        Ok(handle) => Json(json!({ "url": handle.redirect_url })).into_response(),
        Err(e) => {
            if e.status_code() >= 500 {
                error!(error = %e, "Checkout failed");
            }
            e.into_response()
        }
    }
}

async fn get_checkout_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.checkout.get_session(&id).await {
        Ok(session) => Json(session).into_response(),
        // Lookup failures are always reported as upstream errors.
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match state.reconciler.handle_delivery(&body, &headers).await {
        Ok(outcome) => {
            match &outcome {
                WebhookOutcome::Reconciled(report) => info!(
                    session_id = %report.session_id,
                    decremented = report.decremented.len(),
                    skipped = report.skipped.len(),
                    dead_letters = report.dead_letters.len(),
                    "Webhook processed successfully"
                ),
                other => info!(outcome = ?other, "Webhook acknowledged"),
            }
            StatusCode::OK.into_response()
        }
        Err(e) => {
            error!("Webhook verification failed: {}", e);
            (StatusCode::BAD_REQUEST, format!("Webhook Error: {e}")).into_response()
        }
    }
}
