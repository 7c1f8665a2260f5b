use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use aegis_agents::{AgentId, AgentRole, ChaosProfile};
use aegis_core::{AegisPlatform, ApiConfig, Incident};
use aegis_events::{IncidentEvent, IncidentId, Severity};

/// Control API server bound to the platform handle.
#[derive(Clone)]
pub struct ControlApi {
    config: ApiConfig,
    platform: Arc<AegisPlatform>,
}

#[derive(Clone)]
struct AppState {
    platform: Arc<AegisPlatform>,
    operator_token: String,
}

#[derive(Debug, Deserialize)]
struct CreateIncidentRequest {
    severity: Option<Severity>,
    title: String,
    source: String,
}

#[derive(Debug, Serialize)]
struct IncidentResponse {
    incident: Incident,
    version: u64,
}

#[derive(Debug, Deserialize)]
struct EventWindow {
    from: Option<u64>,
    to: Option<u64>,
}

#[derive(Debug, Serialize)]
struct EventsResponse {
    incident_id: String,
    version: u64,
    events: Vec<IncidentEvent>,
}

#[derive(Debug, Deserialize)]
struct ChaosRequest {
    role: String,
    profile: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

impl ControlApi {
    pub fn new(config: ApiConfig, platform: Arc<AegisPlatform>) -> Self {
        Self { config, platform }
    }

    pub async fn start(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        info!(addr = %addr, "starting control API");

        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("control API server error: {}", e);
            }
        });
        Ok(())
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            platform: self.platform.clone(),
            operator_token: self.config.operator_token.clone(),
        };

        let mut router = Router::new()
            .route("/health", get(health))
            .route("/api/v1/incidents", post(create_incident))
            .route("/api/v1/incidents/:id", get(get_incident))
            .route("/api/v1/incidents/:id/events", get(get_events))
            .route("/api/v1/incidents/:id/cancel", post(cancel_incident))
            .route("/api/v1/scenarios/:id/trigger", post(trigger_scenario))
            .route("/api/v1/chaos/byzantine", post(inject_byzantine))
            .with_state(state);

        if self.config.cors_enabled {
            router = router.layer(CorsLayer::permissive());
        }
        router
    }
}

fn error(code: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        code,
        Json(ErrorResponse {
            error: message.into(),
            code: code.as_u16(),
        }),
    )
}

fn parse_incident_id(raw: &str) -> Result<IncidentId, (StatusCode, Json<ErrorResponse>)> {
    raw.parse::<uuid::Uuid>()
        .map(IncidentId)
        .map_err(|_| error(StatusCode::BAD_REQUEST, "malformed incident id"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_incident(
    State(state): State<AppState>,
    Json(request): Json<CreateIncidentRequest>,
) -> Result<(StatusCode, Json<IncidentResponse>), (StatusCode, Json<ErrorResponse>)> {
    let incident_id = state
        .platform
        .orchestrator
        .create_incident(request.severity, &request.title, &request.source)
        .await
        .map_err(orchestrator_error)?;

    let incident = state
        .platform
        .orchestrator
        .incident(incident_id)
        .await
        .map_err(orchestrator_error)?
        .ok_or_else(|| error(StatusCode::NOT_FOUND, "incident vanished after creation"))?;

    let version = incident.version;
    Ok((
        StatusCode::CREATED,
        Json(IncidentResponse { incident, version }),
    ))
}

async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IncidentResponse>, (StatusCode, Json<ErrorResponse>)> {
    let incident_id = parse_incident_id(&id)?;
    let incident = state
        .platform
        .orchestrator
        .incident(incident_id)
        .await
        .map_err(orchestrator_error)?
        .ok_or_else(|| error(StatusCode::NOT_FOUND, "unknown incident"))?;

    let version = incident.version;
    Ok(Json(IncidentResponse { incident, version }))
}

async fn get_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(window): Query<EventWindow>,
) -> Result<Json<EventsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let incident_id = parse_incident_id(&id)?;
    let events = state
        .platform
        .store
        .read(incident_id, window.from.unwrap_or(0), window.to)
        .await
        .map_err(store_error)?;

    let version = events.last().map(|e| e.version).unwrap_or(0);
    Ok(Json(EventsResponse {
        incident_id: incident_id.to_string(),
        version,
        events,
    }))
}

async fn cancel_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let incident_id = parse_incident_id(&id)?;
    if state.platform.orchestrator.cancel_incident(incident_id).await {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(error(StatusCode::NOT_FOUND, "no in-flight pipeline for incident"))
    }
}

async fn trigger_scenario(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, Json<ErrorResponse>)> {
    let batch = crate::scenarios::demo_batch(&id)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("unknown scenario '{id}'")))?;

    let incident_id = state
        .platform
        .orchestrator
        .ingest_batch(batch)
        .await
        .map_err(orchestrator_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "scenario": id,
            "incident_id": incident_id.map(|i| i.to_string()),
        })),
    ))
}

async fn inject_byzantine(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChaosRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let presented = headers
        .get("x-operator-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented != state.operator_token {
        return Err(error(StatusCode::FORBIDDEN, "operator role required"));
    }

    let role = AgentRole::all()
        .into_iter()
        .find(|r| r.as_str() == request.role)
        .ok_or_else(|| error(StatusCode::BAD_REQUEST, "unknown agent role"))?;
    let profile = match request.profile.as_str() {
        "bad_confidence" => ChaosProfile::BadConfidence,
        "forge_signature" => ChaosProfile::ForgeSignature,
        "byzantine" => ChaosProfile::Byzantine,
        "equivocate" => ChaosProfile::Equivocate,
        "silent" => ChaosProfile::Silent,
        other => {
            return Err(error(
                StatusCode::BAD_REQUEST,
                format!("unknown chaos profile '{other}'"),
            ))
        }
    };

    warn!(role = %request.role, profile = %request.profile, "operator armed chaos profile");
    state.platform.chaos.set(AgentId::new(role, 0), profile);
    Ok(StatusCode::ACCEPTED)
}

/// Map orchestrator failures onto the control-API status codes.
fn orchestrator_error(
    err: aegis_core::OrchestratorError,
) -> (StatusCode, Json<ErrorResponse>) {
    use aegis_core::OrchestratorError;
    match &err {
        OrchestratorError::UnknownIncident(_) => error(StatusCode::NOT_FOUND, err.to_string()),
        OrchestratorError::Store(inner) => store_error_ref(inner, err.to_string()),
        OrchestratorError::Consensus(_) => {
            error(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        _ => error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn store_error(err: aegis_events::EventStoreError) -> (StatusCode, Json<ErrorResponse>) {
    let message = err.to_string();
    store_error_ref(&err, message)
}

fn store_error_ref(
    err: &aegis_events::EventStoreError,
    message: String,
) -> (StatusCode, Json<ErrorResponse>) {
    use aegis_events::EventStoreError;
    match err {
        EventStoreError::Conflict { .. } => error(StatusCode::CONFLICT, message),
        EventStoreError::Backpressure => error(StatusCode::TOO_MANY_REQUESTS, message),
        EventStoreError::UnknownIncident(_) => error(StatusCode::NOT_FOUND, message),
        EventStoreError::Integrity { .. } | EventStoreError::Fenced(_) => {
            error(StatusCode::INTERNAL_SERVER_ERROR, message)
        }
        _ => error(StatusCode::INTERNAL_SERVER_ERROR, message),
    }
}
