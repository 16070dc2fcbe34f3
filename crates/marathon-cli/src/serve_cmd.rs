//! The HTTP gateway: the same orchestrator core exposed to clients that
//! would rather speak JSON over HTTP than the length-prefixed worker wire
//! protocol. A thin `axum` veneer over [`RpcFacade`] -- every handler's job
//! is authenticate, translate the HTTP request into a façade call, and
//! translate the result back into a response or an [`AppError`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use marathon_core::error::MarathonError;
use marathon_core::event::Delivery;
use marathon_core::event_bus::EventBus;
use marathon_core::id::TaskId;
use marathon_core::metering::MeteringAggregator;
use marathon_core::recovery;
use marathon_core::registry::NodeRegistry;
use marathon_core::rpc::auth::{generate_api_key, hash_api_key, hash_password, verify_password, ClientAuth, NodeAuth};
use marathon_core::rpc::wire::NodeConnections;
use marathon_core::rpc::{
    CancelTaskRequest, Caller, GetTaskRequest, ListTasksRequest, RpcFacade, SubmitTaskRequest,
};
use marathon_core::scheduler::Scheduler;
use marathon_core::task::{TaskPayload, TaskState};
use marathon_core::task_store::TaskStore;
use marathon_db::queries::users as user_db;

use crate::config::MarathonConfig;

/// Boot the orchestrator: open the database, recover in-flight tasks, wire
/// the node registry/scheduler/event bus/metering/façade together, and run
/// the worker wire listener and the HTTP gateway side by side until a
/// shutdown signal arrives. Mirrors the teacher's `run_dispatch` shutdown
/// idiom -- first Ctrl+C cancels cooperatively, a second force-exits.
pub async fn run(config: &MarathonConfig) -> anyhow::Result<()> {
    marathon_db::pool::ensure_database_exists(&config.db_config).await?;
    let db_pool = marathon_db::pool::create_pool(&config.db_config).await?;
    marathon_db::pool::run_migrations(&db_pool, marathon_db::pool::default_migrations_path()).await?;

    let event_bus = Arc::new(EventBus::default());
    let task_store = Arc::new(TaskStore::new(Arc::clone(&event_bus), Some(db_pool.clone())));
    let registry = Arc::new(NodeRegistry::default());
    let connections = Arc::new(NodeConnections::new());

    let recovered = recovery::recover(&db_pool, &task_store).await?;

    let (scheduler, wake_rx) = Scheduler::new(
        Default::default(),
        Arc::clone(&task_store),
        Arc::clone(&registry),
        Arc::clone(&event_bus),
        Arc::clone(&connections) as Arc<dyn marathon_core::scheduler::WorkerDispatcher>,
    );
    scheduler.enqueue_recovered(recovered);

    let metering = MeteringAggregator::new(Arc::clone(&task_store), Some(db_pool.clone()));
    metering.load().await?;
    Arc::clone(&metering).spawn(&event_bus);

    let client_auth = ClientAuth::new(config.jwt_secret.clone());
    let node_auth = NodeAuth::new(config.node_auth_key.clone());

    let facade = Arc::new(RpcFacade::new(
        Arc::clone(&task_store),
        Arc::clone(&registry),
        Arc::clone(&event_bus),
        Arc::clone(&scheduler),
        metering,
        client_auth,
        node_auth.clone(),
    ));

    let cancel = CancellationToken::new();

    let (sweep_tx, sweep_rx) = tokio::sync::mpsc::channel(32);
    Arc::clone(&registry).spawn_sweeper(marathon_core::registry::DEFAULT_SWEEP_INTERVAL, sweep_tx);
    Arc::clone(&event_bus).spawn_sweeper(std::time::Duration::from_secs(60));

    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run(wake_rx, sweep_rx, cancel.child_token()));

    let worker_bind = config.worker_bind().parse().context("invalid worker bind address")?;
    let worker_task = tokio::spawn(crate::worker_listener::run(
        worker_bind,
        Arc::clone(&facade),
        connections,
        Arc::new(node_auth),
        cancel.child_token(),
    ));

    let state = AppState { facade, db_pool: db_pool.clone() };
    let router = build_router(state);
    let gateway_listener = tokio::net::TcpListener::bind(&config.gateway_bind())
        .await
        .with_context(|| format!("failed to bind HTTP gateway on {}", config.gateway_bind()))?;
    info!(bind = %config.gateway_bind(), "HTTP gateway listening");

    let got_first_signal = Arc::new(AtomicBool::new(false));
    let cancel_for_signal = cancel.clone();
    let got_first_clone = Arc::clone(&got_first_signal);
    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel_for_signal.cancel();
        }
    });

    let gateway_cancel = cancel.child_token();
    let serve_result = axum::serve(gateway_listener, router)
        .with_graceful_shutdown(async move { gateway_cancel.cancelled().await })
        .await;
    if let Err(e) = serve_result {
        warn!(error = %e, "HTTP gateway exited with an error");
    }

    cancel.cancel();
    let _ = worker_task.await;
    let _ = scheduler_task.await;
    db_pool.close().await;

    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Maps every [`MarathonError`] variant onto the HTTP status §7 assigns it,
/// carrying the same `{code, message}` body the worker wire protocol's
/// `ErrorResponse` uses.
pub struct AppError {
    status: StatusCode,
    inner: marathon_core::error::ErrorResponse,
}

impl AppError {
    fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            inner: marathon_core::error::ErrorResponse {
                code: "internal".to_string(),
                message: format!("{err:#}"),
            },
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            inner: marathon_core::error::ErrorResponse {
                code: "invalid_argument".to_string(),
                message: message.into(),
            },
        }
    }
}

impl From<MarathonError> for AppError {
    fn from(err: MarathonError) -> Self {
        let status = match &err {
            MarathonError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            MarathonError::Unauthenticated => StatusCode::UNAUTHORIZED,
            MarathonError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            MarathonError::NotFound(_) => StatusCode::NOT_FOUND,
            MarathonError::StateConflict { .. } => StatusCode::CONFLICT,
            MarathonError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            MarathonError::DispatchFailed(_) | MarathonError::NodeLost(_) => StatusCode::BAD_GATEWAY,
            MarathonError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, inner: err.into() }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.inner)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Shared state and auth extractor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub facade: Arc<RpcFacade>,
    pub db_pool: PgPool,
}

/// Extracts and verifies the `Authorization: Bearer <token>` header before a
/// handler runs, rejecting with `401` otherwise -- the same shape as the
/// teacher's `AppError`-as-`Rejection` extractors, generalized to carry an
/// authenticated [`Caller`] instead of a validated path parameter.
pub struct AuthenticatedCaller(pub Caller);

impl FromRequestParts<AppState> for AuthenticatedCaller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(MarathonError::Unauthenticated)?;
        let token = header_value.strip_prefix("Bearer ").ok_or(MarathonError::Unauthenticated)?;
        let caller = state.facade.authenticate_client(token)?;
        Ok(AuthenticatedCaller(caller))
    }
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct CredentialsBody {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub success: bool,
    pub token: Option<String>,
    pub api_key: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListTasksQuery {
    pub state: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct EventsQuery {
    #[serde(default)]
    pub from_sequence: u64,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/tasks", get(list_tasks).post(submit_task))
        .route("/tasks/{id}", get(get_task).delete(cancel_task))
        .route("/tasks/{id}/events", get(task_events))
        .route("/usage", get(get_usage))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers: auth
// ---------------------------------------------------------------------------

async fn register(
    State(state): State<AppState>,
    Json(body): Json<CredentialsBody>,
) -> Result<Json<AuthResponse>, AppError> {
    if body.username.trim().is_empty() || body.password.len() < 8 {
        return Err(AppError::bad_request("username must be non-empty and password at least 8 characters"));
    }

    if user_db::get_by_username(&state.db_pool, &body.username)
        .await
        .map_err(AppError::internal)?
        .is_some()
    {
        return Ok(Json(AuthResponse {
            success: false,
            token: None,
            api_key: None,
            message: format!("username {} is already taken", body.username),
        }));
    }

    let password_hash = hash_password(&body.password)?;
    let api_key = generate_api_key();
    let api_key_hash = hash_api_key(&api_key);

    let user = user_db::insert_user(&state.db_pool, &body.username, &password_hash, &api_key_hash)
        .await
        .map_err(AppError::internal)?;

    let token = state.facade.issue_client_token(user.id);
    Ok(Json(AuthResponse {
        success: true,
        token: Some(token),
        api_key: Some(api_key),
        message: "registered".to_string(),
    }))
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<CredentialsBody>,
) -> Result<Json<AuthResponse>, AppError> {
    let user = user_db::get_by_username(&state.db_pool, &body.username)
        .await
        .map_err(AppError::internal)?;

    let Some(user) = user else {
        return Ok(Json(AuthResponse {
            success: false,
            token: None,
            api_key: None,
            message: "invalid username or password".to_string(),
        }));
    };

    if verify_password(&body.password, &user.password_hash).is_err() {
        return Ok(Json(AuthResponse {
            success: false,
            token: None,
            api_key: None,
            message: "invalid username or password".to_string(),
        }));
    }

    let token = state.facade.issue_client_token(user.id);
    Ok(Json(AuthResponse {
        success: true,
        token: Some(token),
        api_key: None,
        message: "logged in".to_string(),
    }))
}

// ---------------------------------------------------------------------------
// Handlers: tasks
// ---------------------------------------------------------------------------

async fn list_tasks(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Query(query): Query<ListTasksQuery>,
) -> Result<axum::response::Response, AppError> {
    let state_filter = match query.state {
        Some(s) => Some(s.parse::<TaskState>().map_err(|_| AppError::bad_request(format!("unknown task state {s:?}")))?),
        None => None,
    };
    let tasks = state.facade.list_tasks(caller, ListTasksRequest { state: state_filter }).await?;
    Ok(Json(tasks).into_response())
}

async fn submit_task(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Json(payload): Json<TaskPayload>,
) -> Result<axum::response::Response, AppError> {
    let task = state.facade.submit_task(caller, SubmitTaskRequest { payload }).await?;
    Ok((StatusCode::CREATED, Json(task)).into_response())
}

async fn get_task(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Path(task_id): Path<TaskId>,
) -> Result<axum::response::Response, AppError> {
    let task = state.facade.get_task(caller, GetTaskRequest { task_id }).await?;
    Ok(Json(task).into_response())
}

async fn cancel_task(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Path(task_id): Path<TaskId>,
) -> Result<axum::response::Response, AppError> {
    let task = state.facade.cancel_task(caller, CancelTaskRequest { task_id }).await?;
    Ok(Json(task).into_response())
}

async fn get_usage(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
) -> Result<axum::response::Response, AppError> {
    let usage = state.facade.get_usage(caller).await?;
    Ok(Json(usage).into_response())
}

/// `GET /tasks/{id}/events`: a live server-sent-events stream fed by a
/// subscription against the task's event bus topic. Back-pressure is the
/// event bus's own slow-subscriber-drop policy (§4.B); this handler never
/// buffers beyond what the subscription itself buffers, and unsubscribes
/// automatically when the client disconnects and the stream is dropped.
async fn task_events(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Path(task_id): Path<TaskId>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, AppError> {
    let mut subscription = state.facade.subscribe_task_events(caller, task_id, query.from_sequence)?;

    let stream = async_stream::stream! {
        while let Some(delivery) = subscription.recv().await {
            let reached_terminal = matches!(
                &delivery,
                Delivery::Event(e) if e.state.is_some_and(TaskState::is_terminal)
            );

            let event = match &delivery {
                Delivery::Event(e) => Event::default().event("event").json_data(e),
                Delivery::Gap { .. } => Event::default().event("gap").json_data(&delivery),
                Delivery::Recovered => Ok(Event::default().event("recovered").data("")),
            };
            match event {
                Ok(event) => yield Ok(event),
                Err(_) => continue,
            }

            // §4.G: the server closes the stream itself once the task
            // reaches a terminal state, with a final marker, rather than
            // relying on the client to disconnect after seeing it.
            if reached_terminal {
                if let Ok(done) = Event::default().event("done").json_data(&serde_json::json!({ "task_id": task_id })) {
                    yield Ok(done);
                }
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use marathon_core::event_bus::EventBus;
    use marathon_core::metering::MeteringAggregator;
    use marathon_core::node::Node;
    use marathon_core::registry::NodeRegistry;
    use marathon_core::rpc::auth::{ClientAuth, NodeAuth};
    use marathon_core::rpc::wire::{Frame, MessageType};
    use marathon_core::scheduler::{Scheduler, WorkerDispatcher};
    use marathon_core::task::{Task, TaskPayload};
    use marathon_core::task_store::TaskStore;
    use marathon_test_utils::{create_test_db, drop_test_db};
    use tower::ServiceExt;

    use super::*;

    struct NoopDispatcher;

    #[async_trait]
    impl WorkerDispatcher for NoopDispatcher {
        async fn dispatch_task(&self, _node: &Node, _task: &Task) -> marathon_core::error::Result<()> {
            Ok(())
        }
        async fn send_cancel(&self, _node: &Node, _task_id: TaskId) -> marathon_core::error::Result<()> {
            Ok(())
        }
    }

    async fn test_state(pool: PgPool) -> (AppState, String) {
        let event_bus = Arc::new(EventBus::default());
        let task_store = Arc::new(TaskStore::new(Arc::clone(&event_bus), Some(pool.clone())));
        let registry = Arc::new(NodeRegistry::default());
        let dispatcher = Arc::new(NoopDispatcher);
        let (scheduler, _wake_rx) = Scheduler::new(
            Default::default(),
            Arc::clone(&task_store),
            Arc::clone(&registry),
            Arc::clone(&event_bus),
            dispatcher,
        );
        let metering = MeteringAggregator::new(Arc::clone(&task_store), Some(pool.clone()));
        Arc::clone(&metering).spawn(&event_bus);

        let jwt_secret = b"test-jwt-secret".to_vec();
        let client_auth = ClientAuth::new(jwt_secret.clone());
        let node_auth = NodeAuth::new(b"test-node-key".to_vec());
        let facade = Arc::new(RpcFacade::new(task_store, registry, event_bus, scheduler, metering, client_auth, node_auth));

        let user_id = uuid::Uuid::new_v4();
        let token = facade.issue_client_token(user_id);
        (AppState { facade, db_pool: pool }, token)
    }

    async fn send_request(state: AppState, req: Request<Body>) -> axum::response::Response {
        let app = super::build_router(state);
        app.oneshot(req).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn register_then_login_round_trips_a_token() {
        let (pool, db_name) = create_test_db().await;
        let (state, _token) = test_state(pool.clone()).await;

        let register_body = serde_json::json!({ "username": "alice", "password": "hunter22222" });
        let resp = send_request(
            state.clone(),
            Request::builder()
                .method("POST")
                .uri("/auth/register")
                .header("content-type", "application/json")
                .body(Body::from(register_body.to_string()))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["success"], true);
        assert!(json["token"].is_string());
        assert!(json["api_key"].is_string());

        let login_body = serde_json::json!({ "username": "alice", "password": "hunter22222" });
        let resp = send_request(
            state.clone(),
            Request::builder()
                .method("POST")
                .uri("/auth/login")
                .header("content-type", "application/json")
                .body(Body::from(login_body.to_string()))
                .unwrap(),
        )
        .await;
        let json = body_json(resp).await;
        assert_eq!(json["success"], true);
        assert!(json["api_key"].is_null(), "login should not re-issue the api key");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn login_with_wrong_password_fails_without_error_status() {
        let (pool, db_name) = create_test_db().await;
        let (state, _token) = test_state(pool.clone()).await;

        let register_body = serde_json::json!({ "username": "bob", "password": "correcthorse1" });
        send_request(
            state.clone(),
            Request::builder()
                .method("POST")
                .uri("/auth/register")
                .header("content-type", "application/json")
                .body(Body::from(register_body.to_string()))
                .unwrap(),
        )
        .await;

        let login_body = serde_json::json!({ "username": "bob", "password": "wrong-password" });
        let resp = send_request(
            state.clone(),
            Request::builder()
                .method("POST")
                .uri("/auth/login")
                .header("content-type", "application/json")
                .body(Body::from(login_body.to_string()))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn submit_requires_bearer_token() {
        let (pool, db_name) = create_test_db().await;
        let (state, _token) = test_state(pool.clone()).await;

        let resp = send_request(
            state,
            Request::builder()
                .method("POST")
                .uri("/tasks")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&TaskPayload::default()).unwrap()))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn submit_then_get_task_round_trips() {
        let (pool, db_name) = create_test_db().await;
        let (state, token) = test_state(pool.clone()).await;

        let mut payload = TaskPayload::default();
        payload.repo_url = "https://github.com/example/repo".to_string();
        payload.prompt = "fix the bug".to_string();

        let resp = send_request(
            state.clone(),
            Request::builder()
                .method("POST")
                .uri("/tasks")
                .header("content-type", "application/json")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::from(serde_json::to_string(&payload).unwrap()))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        let task_id = created["id"].as_str().unwrap().to_string();

        let resp = send_request(
            state.clone(),
            Request::builder()
                .uri(format!("/tasks/{task_id}"))
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let fetched = body_json(resp).await;
        assert_eq!(fetched["id"], task_id);
        assert_eq!(fetched["payload"]["repo_url"], "https://github.com/example/repo");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn get_task_owned_by_another_user_is_forbidden() {
        let (pool, db_name) = create_test_db().await;
        let (state, token) = test_state(pool.clone()).await;

        let resp = send_request(
            state.clone(),
            Request::builder()
                .method("POST")
                .uri("/tasks")
                .header("content-type", "application/json")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::from(serde_json::to_string(&TaskPayload::default()).unwrap()))
                .unwrap(),
        )
        .await;
        let created = body_json(resp).await;
        let task_id = created["id"].as_str().unwrap().to_string();

        let other_token = state.facade.issue_client_token(uuid::Uuid::new_v4());
        let resp = send_request(
            state.clone(),
            Request::builder()
                .uri(format!("/tasks/{task_id}"))
                .header("authorization", format!("Bearer {other_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn cancel_queued_task_returns_cancelled_state() {
        let (pool, db_name) = create_test_db().await;
        let (state, token) = test_state(pool.clone()).await;

        let resp = send_request(
            state.clone(),
            Request::builder()
                .method("POST")
                .uri("/tasks")
                .header("content-type", "application/json")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::from(serde_json::to_string(&TaskPayload::default()).unwrap()))
                .unwrap(),
        )
        .await;
        let created = body_json(resp).await;
        let task_id = created["id"].as_str().unwrap().to_string();

        let resp = send_request(
            state.clone(),
            Request::builder()
                .method("DELETE")
                .uri(format!("/tasks/{task_id}"))
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let cancelled = body_json(resp).await;
        assert_eq!(cancelled["state"], "cancelled");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn usage_with_no_tasks_is_zero() {
        let (pool, db_name) = create_test_db().await;
        let (state, token) = test_state(pool.clone()).await;

        let resp = send_request(
            state,
            Request::builder()
                .uri("/usage")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["input_tokens"], 0);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn malformed_state_filter_is_a_bad_request() {
        let (pool, db_name) = create_test_db().await;
        let (state, token) = test_state(pool.clone()).await;

        let resp = send_request(
            state,
            Request::builder()
                .uri("/tasks?state=not-a-real-state")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn unused_message_type_reference_keeps_wire_import_honest() {
        // Ensures the wire re-export paths this module's tests pull in stay
        // consistent with marathon_core::rpc::wire even though the HTTP
        // gateway itself never constructs a Frame.
        let _ = MessageType::Heartbeat;
        let _: Option<Frame> = None;
    }
}
