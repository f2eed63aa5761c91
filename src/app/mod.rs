//! The app: process-level container owning engines, connections, and the
//! pre-migration dispatcher.
//!
//! Every attached connection is serviced by the dispatcher thread until its
//! first command resolves to an engine; from then on the connection posts
//! straight onto that engine's runloop.

pub mod config;
pub mod connection;

use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::config::AppConfig;
use crate::app::connection::{Binding, ChannelPeer, ConnState, ConnectionHandle};
use crate::core::errors::{PlexusError, Result};
use crate::core::logging::init_tracing;
use crate::graph::{Graph, GraphDefinition};
use crate::msg::{
    is_reserved_graph_id, schema, Message, MsgKind, StatusCode, WireMessage, CMD_START_GRAPH,
};
use crate::runtime::engine::{self, EngineHandle, EngineTask, InboundFrom};
use crate::runtime::extension::AddonRegistry;
use crate::runtime::runloop::Runloop;

const ENGINE_START_TIMEOUT: Duration = Duration::from_secs(10);
const ENGINE_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound leg toward another app. Registered per peer uri; the transport
/// owns framing and reconnection.
pub trait RemoteTransport: Send + Sync {
    fn send(&self, msg: WireMessage) -> Result<()>;
}

pub(crate) enum DispatchItem {
    Inbound { conn_id: Uuid, msg: Message },
}

/// State shared between the app facade, the dispatcher, and every engine.
pub struct AppShared {
    pub(crate) uri: String,
    config: AppConfig,
    registry: Arc<AddonRegistry>,
    pub(crate) engines: DashMap<String, EngineHandle>,
    singleton: Mutex<Option<String>>,
    pub(crate) connections: DashMap<Uuid, Arc<ConnState>>,
    remotes: DashMap<String, Arc<dyn RemoteTransport>>,
    dispatcher: Runloop<DispatchItem>,
    self_weak: Weak<AppShared>,
}

impl AppShared {
    pub(crate) fn singleton_graph_id(&self) -> Option<String> {
        self.singleton.lock().ok()?.clone()
    }

    /// Called by an engine right before it replies to its stop request, so
    /// the graph id stops resolving while the reply is still in flight.
    pub(crate) fn engine_gone(&self, graph_id: &str) {
        self.engines.remove(graph_id);
        if let Ok(mut singleton) = self.singleton.lock() {
            if singleton.as_deref() == Some(graph_id) {
                *singleton = None;
            }
        }
    }

    pub(crate) fn forward_remote(&self, uri: &str, msg: WireMessage) -> Result<()> {
        match self.remotes.get(uri) {
            Some(transport) => transport.send(msg),
            None => Err(PlexusError::app_unreachable(uri)),
        }
    }

    /// Entry point for traffic from a connection. Migrated connections
    /// bypass the dispatcher entirely.
    pub(crate) fn inbound_from_connection(&self, conn_id: Uuid, msg: Message) -> Result<()> {
        let conn = self
            .connections
            .get(&conn_id)
            .ok_or_else(|| PlexusError::lifecycle("connection", "connection is closed"))?;
        if let Binding::Engine(graph_id) = conn.binding()? {
            if let Some(handle) = self.engines.get(&graph_id) {
                return handle.sender.post(EngineTask::Inbound {
                    from: InboundFrom::Connection(conn_id),
                    msg,
                });
            }
            // Bound engine is gone; the binding never changes, so the
            // connection can only fail from here on.
            return Err(PlexusError::graph_not_found(graph_id));
        }
        drop(conn);
        if self.dispatcher.is_stopping()? {
            return Err(PlexusError::lifecycle("app", "app is closing"));
        }
        self.dispatcher.post(DispatchItem::Inbound { conn_id, msg })
    }

    pub(crate) fn connection_closed(&self, conn_id: Uuid) {
        let Some((_, conn)) = self.connections.remove(&conn_id) else {
            return;
        };
        debug!(conn = %conn_id, "connection closed");
        let binding = conn.binding().unwrap_or(Binding::Unbound);
        if let Binding::Engine(graph_id) = binding {
            if let Some(handle) = self.engines.get(&graph_id) {
                let scoped =
                    !handle.long_running && handle.owner_connection == Some(conn_id);
                if scoped {
                    info!(graph = %graph_id, conn = %conn_id, "owner gone, stopping graph");
                    let _ = handle.sender.post(EngineTask::Stop { reply: None });
                }
            }
        }
    }

    /// Instantiates a graph and blocks until its engine reports ready.
    pub(crate) fn start_engine(
        &self,
        definition: GraphDefinition,
        long_running: bool,
        owner_connection: Option<Uuid>,
        singleton: bool,
    ) -> Result<String> {
        let graph_id = Uuid::new_v4().to_string();
        let graph = Arc::new(Graph::build(graph_id.clone(), definition)?);
        let handle = engine::spawn(
            self.self_weak.clone(),
            self.uri.clone(),
            graph,
            Arc::clone(&self.registry),
            long_running,
            owner_connection,
        )?;
        self.engines.insert(graph_id.clone(), handle.clone());
        if let Err(err) = handle.wait_ready(ENGINE_START_TIMEOUT) {
            self.engines.remove(&graph_id);
            return Err(err);
        }
        if singleton {
            if let Ok(mut slot) = self.singleton.lock() {
                *slot = Some(graph_id.clone());
            }
        }
        info!(graph = %graph_id, long_running, "graph started");
        Ok(graph_id)
    }

    /// Starts a predefined graph by name. For a singleton that is already
    /// running this returns the running instance's id.
    pub(crate) fn start_predefined(&self, name: &str) -> Result<String> {
        let predefined = self
            .config
            .predefined(name)
            .ok_or_else(|| {
                PlexusError::validation(format!("no predefined graph named {name:?}"))
            })?
            .clone();
        if predefined.singleton {
            if let Some(running) = self.singleton_graph_id() {
                return Ok(running);
            }
        }
        self.start_engine(predefined.graph, true, None, predefined.singleton)
    }

    fn resolve_graph_id(&self, graph_id: &str) -> Result<String> {
        if is_reserved_graph_id(graph_id) {
            return self
                .singleton_graph_id()
                .ok_or_else(|| PlexusError::graph_not_found(graph_id));
        }
        Ok(graph_id.to_string())
    }
}

pub struct App {
    shared: Arc<AppShared>,
    dispatcher_join: Mutex<Option<JoinHandle<()>>>,
}

impl App {
    pub fn new(config: AppConfig, registry: Arc<AddonRegistry>) -> Result<App> {
        if let Some(level) = config.log_level.as_deref() {
            match level.parse::<tracing::Level>() {
                Ok(level) => init_tracing(level),
                Err(_) => {
                    return Err(PlexusError::validation_field(
                        format!("unknown log_level {level:?}"),
                        "log_level",
                    ))
                }
            }
        }
        let dispatcher: Runloop<DispatchItem> = Runloop::new();
        let shared = Arc::new_cyclic(|weak| AppShared {
            uri: config.uri.clone(),
            config,
            registry,
            engines: DashMap::new(),
            singleton: Mutex::new(None),
            connections: DashMap::new(),
            remotes: DashMap::new(),
            dispatcher: dispatcher.clone(),
            self_weak: weak.clone(),
        });
        let weak = Arc::downgrade(&shared);
        let join = std::thread::Builder::new()
            .name("app-dispatcher".to_string())
            .spawn(move || run_dispatcher(weak, dispatcher))
            .map_err(|e| PlexusError::internal(format!("cannot spawn dispatcher: {e}")))?;
        let app = App {
            shared,
            dispatcher_join: Mutex::new(Some(join)),
        };
        app.auto_start()?;
        info!(uri = %app.shared.uri, "app running");
        Ok(app)
    }

    fn auto_start(&self) -> Result<()> {
        let names: Vec<String> = self
            .shared
            .config
            .predefined_graphs
            .iter()
            .filter(|g| g.auto_start)
            .map(|g| g.name.clone())
            .collect();
        for name in names {
            self.shared.start_predefined(&name)?;
        }
        Ok(())
    }

    pub fn uri(&self) -> &str {
        &self.shared.uri
    }

    /// Starts an ad hoc graph from a definition. Returns the fresh graph id,
    /// stable until the graph stops.
    pub fn start_graph(&self, definition: GraphDefinition, long_running: bool) -> Result<String> {
        self.shared.start_engine(definition, long_running, None, false)
    }

    pub fn start_predefined(&self, name: &str) -> Result<String> {
        self.shared.start_predefined(name)
    }

    /// Gracefully stops a graph: in-flight paths drain or time out before
    /// the engine goes away.
    pub fn stop_graph(&self, graph_id: &str) -> Result<()> {
        let resolved = self.shared.resolve_graph_id(graph_id)?;
        let handle = self
            .shared
            .engines
            .get(&resolved)
            .map(|h| h.clone())
            .ok_or_else(|| PlexusError::graph_not_found(&resolved))?;
        let (tx, rx) = mpsc::channel();
        handle.sender.post(EngineTask::Stop {
            reply: Some(crate::runtime::path_table::Responder::Channel(tx)),
        })?;
        let reply = rx.recv_timeout(ENGINE_STOP_TIMEOUT).map_err(|_| {
            PlexusError::timeout("stop_graph", ENGINE_STOP_TIMEOUT.as_millis() as u64)
        })?;
        if reply.status_code == Some(StatusCode::Error) {
            return Err(PlexusError::lifecycle(
                resolved,
                reply.detail().unwrap_or("stop failed").to_string(),
            ));
        }
        handle.wait_closed(ENGINE_STOP_TIMEOUT)
    }

    /// Attaches an in-process peer and returns its driving handle.
    pub fn connect(&self) -> ConnectionHandle {
        let (tx, rx) = mpsc::channel();
        let id = Uuid::new_v4();
        let conn = Arc::new(ConnState::new(id, Box::new(ChannelPeer(tx))));
        self.shared.connections.insert(id, conn);
        debug!(conn = %id, "connection attached");
        ConnectionHandle::new(Arc::downgrade(&self.shared), id, rx)
    }

    pub fn register_remote(&self, uri: impl Into<String>, transport: Arc<dyn RemoteTransport>) {
        self.shared.remotes.insert(uri.into(), transport);
    }

    pub fn running_graphs(&self) -> Vec<String> {
        self.shared.engines.iter().map(|e| e.key().clone()).collect()
    }

    /// Stops every engine and the dispatcher. Idempotent.
    pub fn close(&self) -> Result<()> {
        let handles: Vec<EngineHandle> = self
            .shared
            .engines
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for handle in &handles {
            let _ = handle.sender.post(EngineTask::Stop { reply: None });
        }
        for handle in &handles {
            if let Err(err) = handle.wait_closed(ENGINE_STOP_TIMEOUT) {
                error!(graph = %handle.graph_id(), error = %err, "engine did not stop cleanly");
            }
        }
        self.shared.dispatcher.request_stop()?;
        if let Some(join) = self
            .dispatcher_join
            .lock()
            .map_err(|_| PlexusError::internal("dispatcher join mutex poisoned"))?
            .take()
        {
            join.join()
                .map_err(|_| PlexusError::internal("dispatcher thread panicked"))?;
        }
        info!(uri = %self.shared.uri, "app closed");
        Ok(())
    }
}

impl Drop for App {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "app close during drop failed");
        }
    }
}

fn run_dispatcher(app: Weak<AppShared>, runloop: Runloop<DispatchItem>) {
    loop {
        match runloop.next() {
            Ok(Some(DispatchItem::Inbound { conn_id, msg })) => {
                let Some(app) = app.upgrade() else { break };
                let origin = msg.origin_path_id;
                let name = msg.name.clone();
                if let Err(err) = dispatch_one(&app, conn_id, msg) {
                    warn!(conn = %conn_id, cmd = %name, error = %err, "dispatch failed");
                    if let Some(conn) = app.connections.get(&conn_id) {
                        let reply = Message::error_result(origin, &name, &err.to_string());
                        let _ = conn.send_to_peer(reply);
                    }
                }
                if runloop.task_done().is_err() {
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}

/// Routes one pre-migration message: `start_graph` is handled by the app
/// itself, everything else resolves to an engine and migrates the
/// connection onto it.
fn dispatch_one(app: &Arc<AppShared>, conn_id: Uuid, msg: Message) -> Result<()> {
    let conn = app
        .connections
        .get(&conn_id)
        .map(|c| Arc::clone(&c))
        .ok_or_else(|| PlexusError::lifecycle("connection", "connection is closed"))?;

    if msg.kind == MsgKind::Cmd && msg.name == CMD_START_GRAPH {
        return handle_start_graph(app, &conn, msg);
    }

    if let Some(uri) = msg.destinations.first().and_then(|d| d.app_uri.clone()) {
        if uri != app.uri {
            return app.forward_remote(&uri, WireMessage::from_message(&msg));
        }
    }
    let target = msg
        .destinations
        .first()
        .and_then(|d| d.graph_id.clone())
        .ok_or_else(|| PlexusError::protocol("message names no destination graph"))?;
    let resolved = app.resolve_graph_id(&target)?;
    let handle = app
        .engines
        .get(&resolved)
        .ok_or_else(|| PlexusError::graph_not_found(&resolved))?;
    // The binding is additive: a message queued here while the connection
    // migrated onto another graph is forwarded, not a re-bind.
    if conn.binding()? == Binding::Unbound {
        conn.bind(&resolved)?;
    }
    handle.sender.post(EngineTask::Inbound {
        from: InboundFrom::Connection(conn_id),
        msg,
    })
}

fn handle_start_graph(app: &Arc<AppShared>, conn: &Arc<ConnState>, cmd: Message) -> Result<()> {
    let long_running = cmd
        .properties
        .get("long_running_mode")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let graph_id = match cmd
        .properties
        .get("predefined_graph_name")
        .and_then(Value::as_str)
    {
        Some(name) => app.start_predefined(name)?,
        None => {
            let payload = Value::Object(cmd.properties.clone());
            schema::validate_start_graph(&payload)?;
            let definition: GraphDefinition = serde_json::from_value(payload)?;
            let owner = if long_running { None } else { Some(conn.id) };
            app.start_engine(definition, long_running, owner, false)?
        }
    };
    conn.bind(&graph_id)?;
    let mut reply = Message::result_for(&cmd, StatusCode::Ok);
    reply.set_detail(&graph_id);
    reply
        .properties
        .insert("graph_id".to_string(), json!(graph_id));
    conn.send_to_peer(reply)
}
