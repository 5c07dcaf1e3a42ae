use std::{
    net::SocketAddr,
    sync::{mpsc::Sender, Arc, Mutex},
};

use axum::{
    extract::State,
    http::StatusCode,
    routing::get,
    Json, Router,
};

use crate::{
    threads::Outbox,
    types::{Command, Response, WorkerStatus},
};

pub struct AppState {
    pub commands: Sender<Command>,
    pub outbox: Outbox,
    pub status: Arc<Mutex<WorkerStatus>>,
}

type SharedState = Arc<Mutex<AppState>>;

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/messages", get(take_responses).post(post_command))
        .route("/health", get(get_health))
        .with_state(Arc::new(Mutex::new(app_state)))
}

#[tokio::main]
pub async fn create_server(addr: SocketAddr, app_state: AppState) -> std::io::Result<()> {
    let app = router(app_state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "controller API listening");
    axum::serve(listener, app).await
}

async fn post_command(
    State(state): State<SharedState>,
    Json(command): Json<Command>,
) -> (StatusCode, String) {
    let state = match state.lock() {
        Ok(val) => val,
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error getting lock".to_string(),
            );
        }
    };

    let name = command.name();
    match state.commands.send(command) {
        Ok(_) => {
            tracing::debug!(command = name, "command queued");
            (StatusCode::ACCEPTED, "Command queued".to_string())
        }
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Worker is not running".to_string(),
        ),
    }
}

async fn take_responses(
    State(state): State<SharedState>,
) -> Result<Json<Vec<Response>>, (StatusCode, String)> {
    let state = state.lock().map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error getting lock".to_string(),
        )
    })?;

    let mut outbox = state.outbox.lock().map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error getting lock".to_string(),
        )
    })?;

    let responses: Vec<Response> = outbox.drain(..).collect();
    Ok(Json(responses))
}

async fn get_health(
    State(state): State<SharedState>,
) -> Result<(StatusCode, Json<WorkerStatus>), (StatusCode, String)> {
    let state = state.lock().map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error getting lock".to_string(),
        )
    })?;

    let status = match state.status.lock() {
        Ok(val) => val.clone(),
        Err(_) => {
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error getting lock".to_string(),
            ));
        }
    };

    let code = match status {
        WorkerStatus::Ready { .. } => StatusCode::OK,
        WorkerStatus::Idle | WorkerStatus::Loading { .. } => StatusCode::SERVICE_UNAVAILABLE,
        WorkerStatus::Faulted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Ok((code, Json(status)))
}
