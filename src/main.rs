use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use narrative_server::{
    protocol::{self, ClientMessage, ServerMessage},
    CapabilityRegistry, Database, NarrativeComponent, NarrativeConfig, NarrativeError,
    NarrativeRegistry, NetRole, ScriptHost, SnapshotStore,
};

// ============================================================================
// App State
// ============================================================================

type SharedComponent = Arc<Mutex<NarrativeComponent>>;

#[derive(Clone)]
struct AppState {
    registry: Arc<NarrativeRegistry>,
    db: Arc<Database>,
    config: Arc<NarrativeConfig>,
    // Actor id -> authoritative component
    actors: Arc<DashMap<String, SharedComponent>>,
    // Session ID -> actor id
    sessions: Arc<DashMap<String, String>>,
}

impl AppState {
    async fn new(config: NarrativeConfig) -> Self {
        let db = Database::new(&config.server.database_url)
            .await
            .expect("Failed to initialize database");

        let scripts = Arc::new(ScriptHost::new().expect("Failed to create script host"));
        let script_dir = config.server.data_dir.join("scripts");
        if script_dir.exists() {
            match scripts.load_directory(&script_dir) {
                Ok(count) => info!("Loaded {} narrative scripts", count),
                Err(e) => error!("Failed to load narrative scripts: {}", e),
            }
        }

        let capabilities = CapabilityRegistry::new().with_scripts(scripts);
        let mut registry = NarrativeRegistry::new();
        if let Err(e) = registry.load_from_directory(&config.server.data_dir, &capabilities) {
            error!("Failed to load narrative data: {}", e);
        }

        Self {
            registry: Arc::new(registry),
            db: Arc::new(db),
            config: Arc::new(config),
            actors: Arc::new(DashMap::new()),
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Live component for the actor, restored from its last save on first use
    async fn get_or_load_actor(&self, actor: &str) -> SharedComponent {
        if let Some(existing) = self.actors.get(actor) {
            return existing.clone();
        }

        let mut component = NarrativeComponent::new(
            actor,
            NetRole::Authority,
            self.registry.clone(),
            &self.config,
        );

        match self.db.load_snapshot(actor).await {
            Ok(Some(snapshot)) => {
                component.restore(&snapshot);
            }
            Ok(None) => info!("No saved narrative for {}, starting fresh", actor),
            Err(e) => error!("Failed to load narrative for {}: {}", actor, e),
        }

        self.actors
            .entry(actor.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(component)))
            .clone()
    }
}

async fn save_component(db: &Database, component: &mut NarrativeComponent) {
    let actor = component.actor().to_string();
    match db.save_snapshot(&actor, &component.snapshot()).await {
        Ok(()) => {
            component.mark_saved();
            debug!("Saved narrative for {}", actor);
        }
        Err(e) => error!("Failed to save narrative for {}: {}", actor, e),
    }
}

// ============================================================================
// HTTP Handlers
// ============================================================================

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "quests": state.registry.quest_count(),
        "dialogues": state.registry.dialogue_count(),
        "actors": state.actors.len(),
        "timestamp": chrono::Utc::now().timestamp_millis()
    }))
}

async fn get_snapshot(
    Path(actor): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let live = state.actors.get(&actor).map(|c| c.clone());
    if let Some(component) = live {
        return Json(component.lock().await.snapshot()).into_response();
    }

    match state.db.load_snapshot(&actor).await {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "No narrative saved for this actor").into_response(),
        Err(e) => {
            error!("Failed to load narrative for {}: {}", actor, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to load narrative").into_response()
        }
    }
}

/// Wipe an actor's saved narrative. Refused while the actor is connected.
async fn delete_snapshot(
    Path(actor): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if state.actors.contains_key(&actor) {
        return (StatusCode::CONFLICT, "Actor is connected").into_response();
    }

    match state.db.delete_snapshot(&actor).await {
        Ok(true) => {
            info!("Deleted narrative for {}", actor);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => (StatusCode::NOT_FOUND, "No narrative saved for this actor").into_response(),
        Err(e) => {
            error!("Failed to delete narrative for {}: {}", actor, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete narrative").into_response()
        }
    }
}

// ============================================================================
// WebSocket Handler
// ============================================================================

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(actor): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if actor.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "Actor id required").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, actor))
}

async fn handle_socket(socket: WebSocket, state: AppState, actor: String) {
    let (mut sender, mut receiver) = socket.split();

    let session_id = Uuid::new_v4().to_string();
    state.sessions.insert(session_id.clone(), actor.clone());
    let component = state.get_or_load_actor(&actor).await;
    info!("Actor {} connected (session {})", actor, session_id);

    // Seed the follower: everything up to `sent` is covered by the snapshot
    let mut sent = {
        let component = component.lock().await;
        let sequence = component.replication_log().last_sequence();
        let greeting = [
            ServerMessage::Welcome {
                actor: actor.clone(),
                session_id: session_id.clone(),
            },
            ServerMessage::Snapshot {
                snapshot: component.snapshot(),
                sequence,
            },
        ];
        for msg in &greeting {
            if let Ok(bytes) = protocol::encode_server_message(msg) {
                let _ = sender.send(Message::Binary(bytes)).await;
            }
        }
        sequence
    };

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => {
                let outgoing = {
                    let mut component = component.lock().await;
                    let mut outgoing = match protocol::decode_client_message(&data) {
                        Ok(msg) => handle_client_message(&mut component, msg),
                        Err(e) => {
                            warn!("Bad message from {}: {}", actor, e);
                            vec![ServerMessage::Error {
                                code: "bad_message".to_string(),
                                message: e,
                            }]
                        }
                    };
                    outgoing.extend(collect_outgoing(&mut component, &mut sent));

                    if component.needs_save() {
                        save_component(&state.db, &mut component).await;
                    }
                    outgoing
                };

                for msg in &outgoing {
                    match protocol::encode_server_message(msg) {
                        Ok(bytes) => {
                            if sender.send(Message::Binary(bytes)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => error!("Failed to encode {}: {}", msg.msg_type(), e),
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!("Actor {} disconnected (session {})", actor, session_id);
    state.sessions.remove(&session_id);

    {
        let mut component = component.lock().await;
        component.exit_dialogue();
        if component.is_dirty() {
            save_component(&state.db, &mut component).await;
        }
    }

    // Keep the component while another session still drives this actor
    let still_connected = state.sessions.iter().any(|s| s.value() == &actor);
    if !still_connected {
        state.actors.remove(&actor);
    }
}

/// Apply one client request to the authoritative component
fn handle_client_message(
    component: &mut NarrativeComponent,
    msg: ClientMessage,
) -> Vec<ServerMessage> {
    let result = match msg {
        ClientMessage::CompleteTask { task, argument } => {
            component.complete_task(&task, &argument);
            Ok(())
        }
        ClientMessage::BeginQuest { quest, start_state } => component
            .begin_quest_by_id(&quest, start_state.as_deref())
            .map(|_| ()),
        ClientMessage::RestartQuest { quest, start_state } => match component.quest(&quest) {
            Some(tracked) => {
                let template = tracked.template().clone();
                component.restart_quest(template, start_state.as_deref())
            }
            None => Err(NarrativeError::NotTracked(quest)),
        },
        ClientMessage::ForgetQuest { quest } => component.forget_quest(&quest),
        ClientMessage::BeginDialogue {
            dialogue,
            speaker,
            npc_name,
        } => component.begin_dialogue_by_id(&dialogue, speaker.as_deref(), npc_name.as_deref()),
        ClientMessage::SelectDialogueOption { node } => {
            let reply = component
                .current_dialogue()
                .map(|active| active.asset.find_node(&node));
            match reply {
                Some(Some(reply)) => component.select_dialogue_option(reply).map(|_| ()),
                Some(None) => {
                    debug!("Ignoring reply '{}': not in the current dialogue", node);
                    Ok(())
                }
                None => Err(NarrativeError::NotInDialogue),
            }
        }
        ClientMessage::ExitDialogue => {
            component.exit_dialogue();
            Ok(())
        }
        ClientMessage::RequestSnapshot => {
            return vec![ServerMessage::Snapshot {
                snapshot: component.snapshot(),
                sequence: component.replication_log().last_sequence(),
            }];
        }
    };

    match result {
        Ok(()) => Vec::new(),
        Err(e) => {
            debug!("Request from {} failed: {}", component.actor(), e);
            vec![ServerMessage::Error {
                code: error_code(&e).to_string(),
                message: e.to_string(),
            }]
        }
    }
}

/// Replication entries, dialogue traffic and notices produced since the
/// last call. Falls back to a snapshot when the log was pruned past `sent`.
fn collect_outgoing(component: &mut NarrativeComponent, sent: &mut u64) -> Vec<ServerMessage> {
    let mut outgoing = Vec::new();

    let last = component.replication_log().last_sequence();
    let updates = component.updates_since(*sent);
    if let Some(first) = updates.first() {
        if first.sequence > *sent + 1 {
            warn!("{} fell behind the replication log, resending snapshot", component.actor());
            outgoing.push(ServerMessage::Snapshot {
                snapshot: component.snapshot(),
                sequence: last,
            });
        } else {
            outgoing.push(ServerMessage::NarrativeUpdates {
                updates: updates.to_vec(),
            });
        }
        *sent = last;
    }

    outgoing.extend(
        component
            .drain_dialogue_messages()
            .into_iter()
            .map(|message| ServerMessage::Dialogue { message }),
    );
    outgoing.extend(
        component
            .drain_notices()
            .into_iter()
            .map(|notice| ServerMessage::Notice { notice }),
    );
    outgoing
}

fn error_code(error: &NarrativeError) -> &'static str {
    match error {
        NarrativeError::AlreadyTracked { .. } => "already_tracked",
        NarrativeError::NotTracked(_) => "not_tracked",
        NarrativeError::UnknownQuest(_) => "unknown_quest",
        NarrativeError::UnknownDialogue(_) => "unknown_dialogue",
        NarrativeError::UnknownState { .. } => "unknown_state",
        NarrativeError::MissingRoot(_) => "missing_root",
        NarrativeError::NotInDialogue => "not_in_dialogue",
        NarrativeError::NotAuthority { .. } => "not_authority",
        _ => "invalid_request",
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("narrative_server=info".parse().unwrap()),
        )
        .init();

    let config = NarrativeConfig::from_env().expect("Failed to load configuration");
    let bind = config.server.bind.clone();
    let autosave_secs = config.server.autosave_secs.max(1);
    let state = AppState::new(config).await;

    // Spawn auto-save loop
    let save_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(autosave_secs));
        loop {
            interval.tick().await;

            // Collect first so no map shard stays locked across a save
            let actors: Vec<SharedComponent> = save_state
                .actors
                .iter()
                .map(|entry| entry.value().clone())
                .collect();

            let mut saved_count = 0;
            for component in actors {
                let mut component = component.lock().await;
                if component.is_dirty() {
                    save_component(&save_state.db, &mut component).await;
                    saved_count += 1;
                }
            }

            if saved_count > 0 {
                info!("Auto-saved narrative for {} actor(s)", saved_count);
            }
        }
    });

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route(
            "/actors/:actor/snapshot",
            get(get_snapshot).delete(delete_snapshot),
        )
        .route("/ws/:actor", get(ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::DELETE,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers([axum::http::header::CONTENT_TYPE]),
        )
        .with_state(state);

    let addr: SocketAddr = bind.parse().expect("Invalid bind address");
    info!("Narrative server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
