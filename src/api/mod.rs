//! HTTP surface of the coordinator.
//!
//! Admission errors map onto status codes here; everything that happens after
//! admission is reported through the request's callback URL instead, so the
//! `/message` route in particular never fails towards the relay.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::coordinator::Coordinator;
use crate::error::TssError;
use crate::models::{KeygenRequest, Message, Protocol, SignRequest};

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/keygen", post(keygen))
        .route("/sign", post(sign))
        .route("/message", post(message))
        .route("/threshold", get(threshold))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn ok_response() -> ApiResponse {
    (StatusCode::OK, Json(serde_json::json!({"message": "ok"})))
}

fn error_response(status: StatusCode, err: &TssError) -> ApiResponse {
    (status, Json(serde_json::json!({"message": err.to_string()})))
}

fn keygen_status(err: &TssError) -> StatusCode {
    match err {
        TssError::DuplicatedMessageId | TssError::OperationIsRunning(_) => StatusCode::CONFLICT,
        TssError::KeygenFileExist | TssError::WrongCryptoProtocol => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn sign_status(err: &TssError) -> StatusCode {
    match err {
        TssError::DuplicatedMessageId | TssError::OperationIsRunning(_) => StatusCode::CONFLICT,
        TssError::EddsaNoKeygenDataFound
        | TssError::EcdsaNoKeygenDataFound
        | TssError::WrongDerivationPath
        | TssError::WrongCryptoProtocol => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn keygen(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<KeygenRequest>,
) -> ApiResponse {
    debug!(crypto = %request.crypto, "keygen controller called");

    let protocol = match Protocol::parse(&request.crypto) {
        Ok(protocol) => protocol,
        Err(err) => return error_response(keygen_status(&err), &err),
    };
    if let Err(err) = coordinator.check_operation("keygen", protocol) {
        return error_response(StatusCode::CONFLICT, &err);
    }
    match coordinator.start_keygen(request) {
        Ok(()) => ok_response(),
        Err(err) => error_response(keygen_status(&err), &err),
    }
}

async fn sign(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<SignRequest>,
) -> ApiResponse {
    debug!(crypto = %request.crypto, message = %request.message, "sign controller called");

    let protocol = match Protocol::parse(&request.crypto) {
        Ok(protocol) => protocol,
        Err(err) => return error_response(sign_status(&err), &err),
    };
    if let Err(err) = coordinator.check_operation("sign", protocol) {
        return error_response(StatusCode::CONFLICT, &err);
    }
    match coordinator.start_sign(request) {
        Ok(()) => ok_response(),
        Err(err) => error_response(sign_status(&err), &err),
    }
}

/// Relay-facing route; downstream failures are logged, never surfaced.
async fn message(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<Message>,
) -> ApiResponse {
    debug!(sender = %request.sender, "message controller called");
    coordinator.handle_inbound(request);
    ok_response()
}

#[derive(Debug, Deserialize)]
struct ThresholdQuery {
    crypto: Option<String>,
}

async fn threshold(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<ThresholdQuery>,
) -> ApiResponse {
    let Some(crypto) = query.crypto.filter(|value| !value.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, &TssError::InvalidCryptoFound);
    };
    let protocol = match Protocol::parse(&crypto) {
        Ok(protocol) => protocol,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err),
    };
    match coordinator.threshold(protocol) {
        Ok(threshold) => (
            StatusCode::OK,
            Json(serde_json::json!({"threshold": threshold})),
        ),
        Err(err) => error_response(StatusCode::BAD_REQUEST, &err),
    }
}
