//! Admin Module
//!
//! HTTP surface over the module supervisor and the orchestrator:
//! list and create module instances, start them, report active drivers,
//! health and metrics.

use super::address::ModuleAddress;
use super::supervisor::{
    Module, ModuleContext, ModuleDefault, ModuleInstanceInfo, ModuleRef, ModuleSupervisor,
    ModuleTypeInfo,
};
use crate::controlplane::orchestrator::{Orchestrator, OrchestratorStatus};
use crate::error::{Error, Result};
use async_trait::async_trait;
use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const ADMIN_MODULE_NAME: &str = "admin";
pub const DEFAULT_ADMIN_ADDRESS: &str = "tcp://127.0.0.1:7979";

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

// =============================================================================
// Request/Response Types
// =============================================================================

/// Create a module instance by type ID or type name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    #[serde(default)]
    pub type_id: Option<u32>,
    #[serde(default)]
    pub type_name: Option<String>,
    pub address: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Start the instance right after creating it
    #[serde(default)]
    pub start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
}

impl ApiErrorResponse {
    fn response(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
        (
            status,
            Json(ApiErrorResponse {
                error: error.to_string(),
                message: message.into(),
            }),
        )
            .into_response()
    }
}

fn error_response(err: Error) -> Response {
    let (status, kind) = match &err {
        Error::ModuleUnknownType { .. }
        | Error::ModuleUnknownTypeName { .. }
        | Error::ModuleUnknownInstance { .. } => (StatusCode::NOT_FOUND, "NotFound"),
        Error::InvalidAddress(_) | Error::ModuleInitFailed { .. } | Error::Configuration(_) => {
            (StatusCode::BAD_REQUEST, "InvalidRequest")
        }
        Error::ModuleStartFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "StartFailed"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
    };
    ApiErrorResponse::response(status, kind, err.to_string())
}

// =============================================================================
// Router
// =============================================================================

/// Shared handler state
///
/// The supervisor owns this module, so it is held weakly.
#[derive(Clone)]
pub struct AdminState {
    supervisor: Weak<ModuleSupervisor>,
    orchestrator: Arc<Orchestrator>,
}

impl AdminState {
    pub fn new(supervisor: &Arc<ModuleSupervisor>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            supervisor: Arc::downgrade(supervisor),
            orchestrator,
        }
    }

    fn supervisor(&self) -> std::result::Result<Arc<ModuleSupervisor>, Response> {
        self.supervisor.upgrade().ok_or_else(|| {
            ApiErrorResponse::response(
                StatusCode::SERVICE_UNAVAILABLE,
                "Unavailable",
                "module supervisor has shut down",
            )
        })
    }
}

/// Build the admin router
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/r/module/types", get(list_types))
        .route("/r/module/instances", get(list_instances).post(create_instance))
        .route("/r/module/instances/:id/start", post(start_instance))
        .route("/r/drivers", get(list_drivers))
        .route("/healthz", get(health_check))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

async fn list_types(State(state): State<AdminState>) -> Response {
    match state.supervisor() {
        Ok(supervisor) => {
            let types: Vec<ModuleTypeInfo> =
                supervisor.module_types().iter().map(|t| t.info()).collect();
            (StatusCode::OK, Json(types)).into_response()
        }
        Err(response) => response,
    }
}

async fn list_instances(State(state): State<AdminState>) -> Response {
    match state.supervisor() {
        Ok(supervisor) => {
            let instances: Vec<ModuleInstanceInfo> = supervisor
                .module_instances()
                .iter()
                .map(|i| i.info())
                .collect();
            (StatusCode::OK, Json(instances)).into_response()
        }
        Err(response) => response,
    }
}

async fn create_instance(
    State(state): State<AdminState>,
    Json(request): Json<CreateInstanceRequest>,
) -> Response {
    let supervisor = match state.supervisor() {
        Ok(supervisor) => supervisor,
        Err(response) => return response,
    };

    let created = match (request.type_id, request.type_name.as_deref()) {
        (Some(type_id), _) => supervisor.initialize_module(
            type_id,
            &request.address,
            request.config,
            request.description,
        ),
        (None, Some(name)) => supervisor.initialize_module_by_name(
            name,
            &request.address,
            request.config,
            request.description,
        ),
        (None, None) => {
            return ApiErrorResponse::response(
                StatusCode::BAD_REQUEST,
                "InvalidRequest",
                "typeId or typeName is required",
            )
        }
    };

    let instance = match created {
        Ok(instance) => instance,
        Err(e) => return error_response(e),
    };

    if request.start {
        if let Err(e) = supervisor.start_module(instance.id).await {
            return error_response(e);
        }
    }

    (StatusCode::CREATED, Json(instance.info())).into_response()
}

async fn start_instance(State(state): State<AdminState>, Path(id): Path<u32>) -> Response {
    let supervisor = match state.supervisor() {
        Ok(supervisor) => supervisor,
        Err(response) => return response,
    };

    match supervisor.start_module(id).await {
        Ok(()) => match supervisor.get_module_instance(id) {
            Ok(instance) => (StatusCode::OK, Json(instance.info())).into_response(),
            Err(e) => error_response(e),
        },
        Err(e) => error_response(e),
    }
}

async fn list_drivers(State(state): State<AdminState>) -> Json<OrchestratorStatus> {
    Json(state.orchestrator.status())
}

async fn health_check(State(state): State<AdminState>) -> Response {
    if state.orchestrator.is_shutdown() {
        return ApiErrorResponse::response(
            StatusCode::SERVICE_UNAVAILABLE,
            "ShuttingDown",
            "orchestrator is shutting down",
        );
    }
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
        .into_response()
}

async fn render_metrics(State(state): State<AdminState>) -> Response {
    match state.orchestrator.metrics().render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Module
// =============================================================================

struct Serving {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The admin HTTP module
pub struct AdminModule {
    name: String,
    address: String,
    description: String,
    state: AdminState,
    serving: Mutex<Option<Serving>>,
}

impl AdminModule {
    pub fn new(ctx: ModuleContext, state: AdminState) -> Result<Self> {
        ModuleAddress::parse(&ctx.address)?;
        Ok(Self {
            name: format!("{}-{}", ADMIN_MODULE_NAME, ctx.instance_id),
            address: ctx.address,
            description: ctx
                .description
                .unwrap_or_else(|| "admin HTTP interface".to_string()),
            state,
            serving: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Module for AdminModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn start(&self) -> Result<()> {
        if self.serving.lock().is_some() {
            return Ok(());
        }

        let address = ModuleAddress::parse(&self.address)?;
        let Some(bind) = address.host_port() else {
            return Err(Error::InvalidAddress(format!(
                "{}: admin module serves TCP only",
                self.address
            )));
        };

        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .map_err(|e| Error::Internal(format!("failed to bind {}: {}", bind, e)))?;

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let app = router(self.state.clone());
        let name = self.name.clone();

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(module = %name, error = %e, "admin server error");
            }
        });

        info!(module = %self.name, address = %self.address, "admin API listening");
        *self.serving.lock() = Some(Serving { cancel, task });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let serving = self.serving.lock().take();
        if let Some(serving) = serving {
            serving.cancel.cancel();
            if let Err(e) = serving.task.await {
                warn!(module = %self.name, error = %e, "admin server task ended abnormally");
            }
            info!(module = %self.name, "admin API stopped");
        }
        Ok(())
    }
}

/// Register the admin module type with one default instance at `address`
pub fn register(
    supervisor: &Arc<ModuleSupervisor>,
    orchestrator: Arc<Orchestrator>,
    address: Option<&str>,
) -> u32 {
    let state = AdminState::new(supervisor, orchestrator);
    let address = address.unwrap_or(DEFAULT_ADMIN_ADDRESS);

    supervisor.register_module(
        ADMIN_MODULE_NAME,
        true,
        move |ctx: ModuleContext| -> Result<ModuleRef> {
            Ok(Arc::new(AdminModule::new(ctx, state.clone())?))
        },
        vec![ModuleDefault::at(address)],
    )
}
