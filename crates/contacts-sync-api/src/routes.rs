use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{TimeDelta, Utc};
use contacts_sync_core::google::PeopleGateway;
use contacts_sync_core::models::ConnectionStatus;
use contacts_sync_core::oauth::{GoogleOAuthConfig, GoogleOAuthProvider};
use contacts_sync_core::registry::{RegistryClient, RegistryConfig, RegistryTls};
use contacts_sync_core::store::SqliteStore;
use contacts_sync_core::sync::{
    with_deadline, DeleteOutcome, SingleSyncOutcome, SyncEngine, SyncPolicy, SyncResult,
};
use contacts_sync_core::util::owner_fingerprint;
use contacts_sync_core::vault::AuthorizationRequest;
use contacts_sync_core::{CredentialVault, EncryptionService, LocalId};
use http::{header, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{authenticate_gateway, GatewayUser};
use crate::config::AppConfig;
use crate::error::AppError;

const MAX_CLIENT_ID_LEN: usize = 128;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    engine: SyncEngine,
}

impl AppState {
    pub const fn new(config: Arc<AppConfig>, engine: SyncEngine) -> Self {
        Self { config, engine }
    }

    /// Wire the SQLite store, the Google collaborators and the registry client
    pub fn from_config(config: Arc<AppConfig>) -> Result<Self, AppError> {
        let store = Arc::new(
            SqliteStore::open(&config.database_path)
                .map_err(|error| AppError::Config(format!("Cannot open database: {error}")))?,
        );
        let crypto = EncryptionService::new(&config.encryption_key)
            .map_err(|error| AppError::Config(error.to_string()))?;

        let provider = GoogleOAuthProvider::new(GoogleOAuthConfig::new(
            config.google_client_id.clone(),
            config.google_client_secret.clone(),
            config.google_redirect_url.clone(),
        ))
        .map_err(|error| AppError::Config(error.to_string()))?;

        let vault = CredentialVault::new(store.clone(), store.clone(), Arc::new(provider), crypto)
            .with_expiry_skew(to_time_delta(config.token_expiry_skew)?)
            .with_state_ttl(to_time_delta(config.oauth_state_ttl)?);

        let people = PeopleGateway::new(config.http_timeout)
            .and_then(|gateway| gateway.with_base_url(&config.people_api_url))
            .map_err(|error| AppError::Config(error.to_string()))?;

        let tls = config
            .registry_tls
            .as_ref()
            .map(|paths| RegistryTls::from_files(&paths.cert, &paths.key, &paths.ca))
            .transpose()
            .map_err(|error| AppError::Config(error.to_string()))?;
        let registry = RegistryClient::new(RegistryConfig {
            base_url: config.registry_url.clone(),
            gateway_secret: config.gateway_secret.clone(),
            request_timeout: config.http_timeout,
            tls,
        })
        .map_err(|error| AppError::Config(error.to_string()))?;

        let engine = SyncEngine::new(vault, Arc::new(people), Arc::new(registry), store)
            .with_policy(SyncPolicy {
                propagate_local_deletions: config.propagate_local_deletions,
            });

        Ok(Self::new(config, engine))
    }
}

fn to_time_delta(duration: std::time::Duration) -> Result<TimeDelta, AppError> {
    TimeDelta::from_std(duration).map_err(|error| AppError::Config(error.to_string()))
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/oauth/authorize", get(begin_authorization))
        .route("/oauth/status", get(connection_status))
        .route("/oauth/disconnect", post(disconnect))
        .route("/sync", post(run_full_sync))
        .route("/sync/incremental", post(run_incremental_sync))
        .route(
            "/sync/clients/{client_id}",
            post(sync_client).delete(delete_client),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_gateway));

    // The provider redirects the browser here; no gateway headers are present
    let public_routes = Router::new().route("/oauth/callback", get(oauth_callback));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes.merge(public_routes))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config))
        .with_state(state)
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static("x-user-id"),
            HeaderName::from_static("x-gateway-key"),
        ]);

    if config.allowed_origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }
    let origins = config
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect::<Vec<_>>();
    layer.allow_origin(AllowOrigin::list(origins))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

async fn require_gateway(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let user = authenticate_gateway(request.headers(), &state.config.gateway_secret)
        .inspect_err(|error| {
            tracing::warn!(path = %request.uri().path(), "Rejected request: {}", error);
        })?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

#[derive(Debug, Serialize)]
struct ActionResponse<T> {
    success: bool,
    result: T,
}

impl<T> ActionResponse<T> {
    const fn new(result: T) -> Self {
        Self {
            success: true,
            result,
        }
    }
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    success: bool,
    message: &'static str,
}

async fn begin_authorization(
    State(state): State<AppState>,
    Extension(user): Extension<GatewayUser>,
) -> Result<Json<AuthorizationRequest>, AppError> {
    let request = state.engine.vault().begin_authorization(&user.owner_id).await?;
    Ok(Json(request))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn oauth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<MessageResponse>, AppError> {
    if let Some(error) = query.error.filter(|error| !error.trim().is_empty()) {
        tracing::warn!(endpoint = "oauth_callback", "Provider returned an error: {}", error);
        return Err(AppError::bad_request(format!("OAuth error: {error}")));
    }

    let code = query.code.filter(|code| !code.trim().is_empty());
    let oauth_state = query.state.filter(|value| !value.trim().is_empty());
    let (Some(code), Some(oauth_state)) = (code, oauth_state) else {
        return Err(AppError::bad_request("Missing code or state"));
    };

    let deadline = state.config.single_sync_deadline;
    let owner_id = tokio::time::timeout(
        deadline,
        state
            .engine
            .vault()
            .complete_authorization(&oauth_state, &code),
    )
    .await
    .map_err(|_| AppError::Timeout(deadline))??;

    tracing::info!(
        endpoint = "oauth_callback",
        owner = owner_fingerprint(owner_id.as_str()),
        "Google account connected"
    );
    Ok(Json(MessageResponse {
        success: true,
        message: "Google account connected successfully",
    }))
}

async fn connection_status(
    State(state): State<AppState>,
    Extension(user): Extension<GatewayUser>,
) -> Result<Json<ConnectionStatus>, AppError> {
    let status = state.engine.vault().connection_status(&user.owner_id).await?;
    Ok(Json(status))
}

async fn disconnect(
    State(state): State<AppState>,
    Extension(user): Extension<GatewayUser>,
) -> Result<Json<MessageResponse>, AppError> {
    state.engine.vault().disconnect(&user.owner_id).await?;
    Ok(Json(MessageResponse {
        success: true,
        message: "Google account disconnected",
    }))
}

async fn run_full_sync(
    State(state): State<AppState>,
    Extension(user): Extension<GatewayUser>,
) -> Result<Json<ActionResponse<SyncResult>>, AppError> {
    let result = with_deadline(
        state.config.full_sync_deadline,
        state.engine.run(&user.owner_id),
    )
    .await?;
    Ok(Json(ActionResponse::new(result)))
}

async fn run_incremental_sync(
    State(state): State<AppState>,
    Extension(user): Extension<GatewayUser>,
) -> Result<Json<ActionResponse<SyncResult>>, AppError> {
    let result = with_deadline(
        state.config.incremental_sync_deadline,
        state.engine.run_incremental(&user.owner_id),
    )
    .await?;
    Ok(Json(ActionResponse::new(result)))
}

async fn sync_client(
    State(state): State<AppState>,
    Extension(user): Extension<GatewayUser>,
    Path(client_id): Path<String>,
) -> Result<Json<ActionResponse<SingleSyncOutcome>>, AppError> {
    let local_id = parse_client_id(&client_id)?;
    let outcome = with_deadline(
        state.config.single_sync_deadline,
        state.engine.sync_one(&user.owner_id, &local_id),
    )
    .await?;
    tracing::info!(
        endpoint = "sync_client",
        owner = owner_fingerprint(user.owner_id.as_str()),
        local_id = %local_id,
        "Client pushed to Google"
    );
    Ok(Json(ActionResponse::new(outcome)))
}

async fn delete_client(
    State(state): State<AppState>,
    Extension(user): Extension<GatewayUser>,
    Path(client_id): Path<String>,
) -> Result<Json<ActionResponse<DeleteOutcome>>, AppError> {
    let local_id = parse_client_id(&client_id)?;
    let outcome = with_deadline(
        state.config.single_sync_deadline,
        state.engine.delete_synced(&user.owner_id, &local_id),
    )
    .await?;
    Ok(Json(ActionResponse::new(outcome)))
}

fn parse_client_id(raw: &str) -> Result<LocalId, AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::bad_request("Client ID is required"));
    }
    if trimmed.len() > MAX_CLIENT_ID_LEN || trimmed.chars().any(char::is_control) {
        return Err(AppError::bad_request("Client ID is malformed"));
    }
    Ok(LocalId::from(trimmed))
}
