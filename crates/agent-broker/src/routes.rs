use agent_broker_api::{
    BindingResponse, CatalogResponse, ErrorResponse, LastOperationResponse, OperationResponse,
    ProvisionRequest, ProvisionResponse, UpdateRequest, UpgradeRequest, UpgradeResponse,
    UpgradeStatusResponse, ORIGINATING_IDENTITY_HEADER,
};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::{get, post, put};
use axum::{middleware, Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::BrokerError;
use crate::{auth, identity, State};

#[derive(Debug, Default, Deserialize)]
pub struct AsyncQuery {
    #[serde(default)]
    pub accepts_incomplete: Option<bool>,
}

impl AsyncQuery {
    fn require(&self) -> Result<(), BrokerError> {
        if self.accepts_incomplete == Some(true) {
            Ok(())
        } else {
            Err(BrokerError::AsyncRequired)
        }
    }
}

pub fn router(state: State) -> Router {
    Router::new()
        .route("/catalog", get(catalog))
        .route(
            "/instances/:instance_id",
            put(provision).patch(update).delete(deprovision),
        )
        .route("/instances/:instance_id/last_operation", get(last_operation))
        .route(
            "/instances/:instance_id/bindings/:binding_id",
            put(bind).delete(unbind),
        )
        .route("/admin/upgrade", post(upgrade))
        .route("/admin/upgrade/status", get(upgrade_status))
        .route_layer(middleware::from_fn(auth::require_basic_auth))
        .route("/health-check", get(health_check))
        .fallback(fallback)
        .layer(Extension(state))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, BrokerError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| BrokerError::BadRequest(rejection.body_text()))
}

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn catalog(Extension(state): Extension<State>) -> Json<CatalogResponse> {
    Json(state.controller.catalog().to_response())
}

pub async fn provision(
    Extension(state): Extension<State>,
    Path(instance_id): Path<String>,
    Query(query): Query<AsyncQuery>,
    headers: HeaderMap,
    body: Result<Json<ProvisionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ProvisionResponse>), BrokerError> {
    query.require()?;
    let request = json_body(body)?;
    let owner = request
        .parameters
        .owner
        .as_deref()
        .map(str::trim)
        .filter(|owner| !owner.is_empty())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(ORIGINATING_IDENTITY_HEADER)
                .and_then(|value| value.to_str().ok())
                .and_then(identity::originating_user)
        })
        .unwrap_or_default();
    let response = state
        .controller
        .provision(&instance_id, &request, owner)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn update(
    Extension(state): Extension<State>,
    Path(instance_id): Path<String>,
    Query(query): Query<AsyncQuery>,
    body: Result<Json<UpdateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<OperationResponse>), BrokerError> {
    query.require()?;
    let request = json_body(body)?;
    let operation = state.controller.update(&instance_id, &request).await?;
    Ok((StatusCode::ACCEPTED, Json(OperationResponse { operation })))
}

/// `accepts_incomplete` is accepted but not required here, so orphan cleanup
/// works for clients that never send it.
pub async fn deprovision(
    Extension(state): Extension<State>,
    Path(instance_id): Path<String>,
) -> Result<(StatusCode, Json<OperationResponse>), BrokerError> {
    let operation = state.controller.deprovision(&instance_id).await?;
    Ok((StatusCode::ACCEPTED, Json(OperationResponse { operation })))
}

pub async fn last_operation(
    Extension(state): Extension<State>,
    Path(instance_id): Path<String>,
) -> Result<Json<LastOperationResponse>, BrokerError> {
    Ok(Json(state.controller.last_operation(&instance_id).await?))
}

pub async fn bind(
    Extension(state): Extension<State>,
    Path((instance_id, binding_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<BindingResponse>), BrokerError> {
    let binding = state.controller.bind(&instance_id, &binding_id).await?;
    Ok((StatusCode::CREATED, Json(binding)))
}

pub async fn unbind(
    Extension(state): Extension<State>,
    Path((instance_id, binding_id)): Path<(String, String)>,
) -> Json<Value> {
    state.controller.unbind(&instance_id, &binding_id).await;
    Json(json!({}))
}

pub async fn upgrade(
    Extension(state): Extension<State>,
    body: Result<Json<UpgradeRequest>, JsonRejection>,
) -> Result<Json<UpgradeResponse>, BrokerError> {
    let request = json_body(body)?;
    let upgrading = state
        .upgrades
        .upgrade(&request.target_version, request.count, request.max_parallel)
        .await?;
    Ok(Json(UpgradeResponse { upgrading }))
}

pub async fn upgrade_status(Extension(state): Extension<State>) -> Json<UpgradeStatusResponse> {
    Json(state.upgrades.status().await)
}

pub async fn fallback(uri: Uri) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new(
            "NotFound",
            Some(format!("no route for {uri}")),
        )),
    )
}
