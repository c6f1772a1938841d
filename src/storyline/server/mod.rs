// SPDX-License-Identifier: MIT

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::storyline::engine::{RunHandle, StoryEngine, StoryRequest};
use crate::storyline::flow::NodeKind;

/// Engine plus the runs currently in flight, keyed by request id
#[derive(Clone)]
pub struct AppState {
    engine: Arc<StoryEngine>,
    runs: Arc<Mutex<HashMap<String, Arc<RunHandle>>>>,
}

impl AppState {
    pub fn new(engine: Arc<StoryEngine>) -> Self {
        Self {
            engine,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Entry in the in-flight table for one fired run.
///
/// Dropping it removes the entry. If the handler was dropped before the run
/// finished (client went away) the run is cancelled too.
struct InFlight {
    runs: Arc<Mutex<HashMap<String, Arc<RunHandle>>>>,
    request_id: String,
    handle: Arc<RunHandle>,
    finished: bool,
}

impl InFlight {
    fn register(state: &AppState, request_id: &str, handle: Arc<RunHandle>) -> Self {
        state
            .runs
            .lock()
            .insert(request_id.to_string(), Arc::clone(&handle));
        Self {
            runs: Arc::clone(&state.runs),
            request_id: request_id.to_string(),
            handle,
            finished: false,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.runs.lock().remove(&self.request_id);
        if !self.finished {
            log::warn!("Fire request {} dropped, cancelling the run", self.request_id);
            self.handle.cancel_all();
        }
    }
}

pub fn router(engine: Arc<StoryEngine>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/stories", get(list_stories))
        .route("/api/stories/{id}", get(get_story))
        .route("/api/stories/{id}/fire", post(fire_story))
        .route("/api/runs/{request_id}/cancel", post(cancel_run))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState::new(engine))
}

pub async fn serve(
    engine: Arc<StoryEngine>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(engine);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    log::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_stories(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.engine.story_ids().await))
}

async fn get_story(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    let Some(graph) = state.engine.story(&id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Story '{}' not found", id)})),
        );
    };
    let nodes: Vec<Value> = graph
        .nodes()
        .iter()
        .map(|node| {
            let mut entry = json!({
                "id": node.id,
                "kind": node.kind.name(),
                "outgoing": node.outgoing().len(),
            });
            if node.is_aggregating() {
                entry["required_incoming"] = json!(node.required_incoming);
            }
            if let NodeKind::ServiceTask(task) = &node.kind {
                entry["task"] = json!(task.label());
            }
            entry
        })
        .collect();
    (
        StatusCode::OK,
        Json(json!({
            "id": graph.id,
            "name": graph.name,
            "nodes": nodes,
            "flows": graph.flow_count(),
        })),
    )
}

async fn fire_story(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut request): Json<StoryRequest>,
) -> (StatusCode, Json<Value>) {
    request.story_id = id;
    let handle = state.engine.new_handle(&request);
    let mut in_flight = InFlight::register(&state, &request.request_id, Arc::clone(&handle));

    let outcome = state.engine.fire_with(request, handle).await;
    in_flight.finished = true;
    drop(in_flight);

    match outcome {
        Ok(result) => (StatusCode::OK, Json(result.to_json())),
        Err(e) => {
            let status = match e {
                crate::sdk::error::StoryError::StoryNotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(json!({"error": {"code": e.code(), "message": e.to_string()}})),
            )
        }
    }
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    let handle = state.runs.lock().get(&request_id).cloned();
    match handle {
        Some(handle) => {
            handle.cancel_all();
            (StatusCode::OK, Json(json!({"cancelled": request_id})))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("No run '{}' in flight", request_id)})),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storyline::config::EngineConfig;
    use crate::sdk::task::{TaskOutcome, TaskRequest, TaskService};
    use crate::storyline::flow::{ProcessGraph, ServiceTask};
    use crate::storyline::registry::TaskRegistry;

    async fn state() -> AppState {
        let engine = StoryEngine::new(EngineConfig::default(), TaskRegistry::new());
        let mut graph = ProcessGraph::new("hello");
        let start = graph.add_node("start", NodeKind::Start);
        let end = graph.add_node("end", NodeKind::End);
        graph.connect("f1", start, end, None, false);
        engine.register_graph(graph).await.unwrap();
        AppState::new(Arc::new(engine))
    }

    #[tokio::test]
    async fn test_health_check() {
        let Json(body) = health_check().await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_list_and_get_story() {
        let state = state().await;
        let Json(ids) = list_stories(State(state.clone())).await;
        assert_eq!(ids, json!(["hello"]));

        let (status, Json(body)) = get_story(State(state.clone()), Path("hello".to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["nodes"][1]["required_incoming"], 1);

        let (status, _) = get_story(State(state), Path("nope".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fire_story() {
        let state = state().await;
        let request = StoryRequest::new("ignored", json!({"x": 1}));
        let (status, Json(body)) = fire_story(
            State(state.clone()),
            Path("hello".to_string()),
            Json(request),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["trace"], json!(["start", "end"]));
        assert!(state.runs.lock().is_empty());
    }

    struct Sleeper;

    #[async_trait::async_trait]
    impl TaskService for Sleeper {
        fn name(&self) -> &str {
            "sleep"
        }

        async fn invoke(
            &self,
            _request: TaskRequest,
        ) -> Result<TaskOutcome, Box<dyn std::error::Error + Send + Sync>> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok(TaskOutcome::Empty)
        }
    }

    #[tokio::test]
    async fn test_dropped_fire_request_leaves_no_run_behind() {
        let registry = TaskRegistry::new();
        registry.register(Arc::new(Sleeper)).await;
        let engine = StoryEngine::new(EngineConfig::default(), registry);
        let mut graph = ProcessGraph::new("sleepy");
        let start = graph.add_node("start", NodeKind::Start);
        let task = graph.add_node("nap", NodeKind::ServiceTask(ServiceTask::service("sleep")));
        let end = graph.add_node("end", NodeKind::End);
        graph.connect("f1", start, task, None, false);
        graph.connect("f2", task, end, None, false);
        engine.register_graph(graph).await.unwrap();
        let state = AppState::new(Arc::new(engine));

        let request = StoryRequest::new("sleepy", json!({}));
        let request_id = request.request_id.clone();
        let fire = fire_story(State(state.clone()), Path("sleepy".to_string()), Json(request));
        let outcome = tokio::time::timeout(std::time::Duration::from_millis(50), fire).await;
        assert!(outcome.is_err());

        assert!(state.runs.lock().is_empty());
        let (status, _) = cancel_run(State(state), Path(request_id)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_in_flight_entry_cancels_unfinished_run() {
        let state = state().await;
        let handle = Arc::new(RunHandle::new("r-1", Default::default()));
        let entry = InFlight::register(&state, "r-1", Arc::clone(&handle));
        assert!(state.runs.lock().contains_key("r-1"));

        drop(entry);
        assert!(state.runs.lock().is_empty());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_unknown_run() {
        let state = state().await;
        let (status, _) = cancel_run(State(state), Path("missing".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
