use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use server_api::{
    create_conversation, delete_conversation, get_agent, get_messages, list_conversations,
    send_message, update_conversation, ApiContext, EchoResponder,
};
use shared::{
    domain::{AgentId, ConversationId, UserId},
    error::ApiError,
    protocol::{
        Agent, ConversationPatch, ConversationPayload, CreateConversationRequest,
        CreatedConversation, MessagePayload, SendMessageRequest, SendMessageResponse,
    },
};
use storage::{NewAgent, Storage};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info};

mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, prepare_database_url, Settings};

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let default_agent = seed_default_agent(&storage, &settings).await?;
    info!(agent_id = default_agent.0, name = %settings.default_agent_name, "default agent ready");

    let state = AppState {
        api: ApiContext {
            storage,
            responder: Arc::new(EchoResponder),
        },
        default_agent,
    };
    let app = build_router(Arc::new(state), settings.max_body_bytes);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn seed_default_agent(storage: &Storage, settings: &Settings) -> anyhow::Result<AgentId> {
    storage
        .upsert_agent(&NewAgent {
            name: &settings.default_agent_name,
            avatar_url: settings.default_agent_avatar_url.as_deref(),
            is_default: true,
            model: &settings.default_agent_model,
            model_provider: &settings.default_agent_provider,
        })
        .await
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/conversations",
            get(http_list_conversations).post(http_create_conversation),
        )
        .route(
            "/conversations/:conversation_id",
            axum::routing::patch(http_update_conversation).delete(http_delete_conversation),
        )
        .route(
            "/conversations/:conversation_id/messages",
            get(http_get_messages).post(http_send_message),
        )
        .route("/agents/default", get(http_default_agent))
        .route("/agents/:agent_id", get(http_get_agent))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status =
        StatusCode::from_u16(err.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok("ok")
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> ApiResult<Json<Vec<ConversationPayload>>> {
    list_conversations(&state.api, UserId(q.user_id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_create_conversation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateConversationRequest>,
) -> ApiResult<(StatusCode, Json<CreatedConversation>)> {
    create_conversation(&state.api, req)
        .await
        .map(|created| (StatusCode::CREATED, Json(created)))
        .map_err(reject)
}

async fn http_get_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
) -> ApiResult<Json<Vec<MessagePayload>>> {
    get_messages(&state.api, ConversationId(conversation_id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Json<SendMessageResponse>> {
    send_message(&state.api, ConversationId(conversation_id), req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_update_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Json(patch): Json<ConversationPatch>,
) -> ApiResult<StatusCode> {
    update_conversation(&state.api, ConversationId(conversation_id), patch)
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(reject)
}

async fn http_delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
) -> ApiResult<StatusCode> {
    delete_conversation(&state.api, ConversationId(conversation_id))
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(reject)
}

async fn http_get_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<i64>,
) -> ApiResult<Json<Agent>> {
    get_agent(&state.api, AgentId(agent_id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_default_agent(State(state): State<Arc<AppState>>) -> ApiResult<Json<Agent>> {
    get_agent(&state.api, state.default_agent)
        .await
        .map(Json)
        .map_err(reject)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
