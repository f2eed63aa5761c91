//! The engine: one running instantiation of a graph.
//!
//! An engine owns one dedicated thread, the graph's path table, the timer
//! heap, and one [`GroupHandle`] per extension group. Its thread is the only
//! one that touches the path table; everything else reaches the engine by
//! posting [`EngineTask`]s onto its runloop.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppShared;
use crate::core::errors::{PlexusError, Result};
use crate::core::waitable::{Timeout, WaitOutcome, Waitable};
use crate::graph::Graph;
use crate::msg::conversion::MsgConversion;
use crate::msg::{
    is_reserved_graph_id, Destination, Message, MsgKind, PathId, StatusCode, WireMessage,
    CMD_STOP_GRAPH,
};
use crate::runtime::extension::{AddonRegistry, ResultHandler};
use crate::runtime::path_table::{PathTable, Responder, ReturnPolicy, Terminal};
use crate::runtime::runloop::{Polled, Runloop};
use crate::runtime::thread::{ExtensionSpec, GroupHandle, GroupTask};

/// Expectation attached to an extension-originated command.
pub struct Expect {
    pub policy: ReturnPolicy,
    pub timeout: Option<Duration>,
    pub group: String,
    pub extension: String,
    pub handler: ResultHandler,
}

/// Who handed an inbound message to the engine.
pub enum InboundFrom {
    Connection(Uuid),
    Engine(EngineSender),
    Channel(std::sync::mpsc::Sender<Message>),
}

impl InboundFrom {
    fn into_responder(self) -> Responder {
        match self {
            InboundFrom::Connection(id) => Responder::Connection(id),
            InboundFrom::Engine(sender) => Responder::Engine(sender),
            InboundFrom::Channel(tx) => Responder::Channel(tx),
        }
    }
}

pub enum EngineTask {
    /// Message from a connection, the dispatcher, or another engine.
    Inbound { from: InboundFrom, msg: Message },
    /// Message emitted by one of this engine's extensions.
    Outbound {
        from_ext: String,
        msg: Message,
        expect: Option<Expect>,
    },
    /// A result coming home to this engine's path table.
    Result(Message),
    GroupStarted {
        group: String,
    },
    GroupStartFailed {
        group: String,
        error: String,
    },
    GroupStopped {
        group: String,
    },
    StartTimer {
        extension: String,
        name: String,
        interval: Duration,
        repeat: Option<u32>,
    },
    StopTimer {
        extension: String,
        name: String,
    },
    /// Graceful shutdown request; `reply` gets the stop result.
    Stop { reply: Option<Responder> },
}

/// Cloneable posting handle to an engine's runloop.
#[derive(Clone)]
pub struct EngineSender {
    pub graph_id: String,
    runloop: Runloop<EngineTask>,
}

impl EngineSender {
    pub(crate) fn post(&self, task: EngineTask) -> Result<()> {
        self.runloop.post(task)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Starting,
    Ready,
    Closing,
    Closed,
    Failed(String),
}

/// App-side record of a live engine. The graph id is valid exactly as long
/// as this handle sits in the app's engines map.
#[derive(Clone)]
pub struct EngineHandle {
    pub sender: EngineSender,
    pub state: Waitable<EngineState>,
    pub long_running: bool,
    pub owner_connection: Option<Uuid>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EngineHandle {
    pub fn graph_id(&self) -> &str {
        &self.sender.graph_id
    }

    /// Blocks until the engine reports Ready (or failed to start).
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let outcome = self.state.wait_until(
            |s| {
                matches!(
                    s,
                    EngineState::Ready | EngineState::Closed | EngineState::Failed(_)
                )
            },
            Timeout::After(timeout),
        )?;
        if outcome == WaitOutcome::TimedOut {
            return Err(PlexusError::timeout(
                "engine start",
                timeout.as_millis() as u64,
            ));
        }
        match self.state.get()? {
            EngineState::Ready => Ok(()),
            EngineState::Failed(e) => Err(PlexusError::internal(e)),
            other => Err(PlexusError::lifecycle(
                self.graph_id(),
                format!("engine is {other:?} instead of ready"),
            )),
        }
    }

    /// Blocks until the engine thread has fully exited.
    pub fn wait_closed(&self, timeout: Duration) -> Result<()> {
        let outcome = self
            .state
            .wait_until(|s| *s == EngineState::Closed, Timeout::After(timeout))?;
        if outcome == WaitOutcome::TimedOut {
            return Err(PlexusError::timeout(
                "engine stop",
                timeout.as_millis() as u64,
            ));
        }
        if let Some(join) = self
            .join
            .lock()
            .map_err(|_| PlexusError::internal("engine join mutex poisoned"))?
            .take()
        {
            join.join()
                .map_err(|_| PlexusError::internal("engine thread panicked"))?;
        }
        Ok(())
    }
}

struct TimerEntry {
    extension: String,
    name: String,
    interval: Duration,
    remaining: Option<u32>,
    cancelled: bool,
}

struct Engine {
    graph: Arc<Graph>,
    sender: EngineSender,
    state: Waitable<EngineState>,
    app: Weak<AppShared>,
    app_uri: String,
    registry: Arc<AddonRegistry>,
    groups: HashMap<String, GroupHandle>,
    starting_groups: HashSet<String>,
    stopped_groups: HashSet<String>,
    table: PathTable,
    timers: HashMap<u64, TimerEntry>,
    timer_heap: BinaryHeap<Reverse<(Instant, u64)>>,
    timer_keys: HashMap<(String, String), u64>,
    next_timer_id: u64,
    closing: bool,
    stop_reply: Option<Responder>,
    stop_origin: Option<PathId>,
}

/// Starts an engine for a validated graph. Returns once the engine thread
/// is launched; readiness is awaited separately via the handle.
pub(crate) fn spawn(
    app: Weak<AppShared>,
    app_uri: String,
    graph: Arc<Graph>,
    registry: Arc<AddonRegistry>,
    long_running: bool,
    owner_connection: Option<Uuid>,
) -> Result<EngineHandle> {
    let runloop: Runloop<EngineTask> = Runloop::new();
    let sender = EngineSender {
        graph_id: graph.id.clone(),
        runloop: runloop.clone(),
    };
    let state = Waitable::new(EngineState::Starting);

    let engine = Engine {
        graph: Arc::clone(&graph),
        sender: sender.clone(),
        state: state.clone(),
        app,
        app_uri,
        registry,
        groups: HashMap::new(),
        starting_groups: HashSet::new(),
        stopped_groups: HashSet::new(),
        table: PathTable::new(),
        timers: HashMap::new(),
        timer_heap: BinaryHeap::new(),
        timer_keys: HashMap::new(),
        next_timer_id: 0,
        closing: false,
        stop_reply: None,
        stop_origin: None,
    };

    let thread_name = format!("engine-{}", &graph.id[..graph.id.len().min(8)]);
    let join = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || engine.run(runloop))
        .map_err(|e| PlexusError::internal(format!("cannot spawn engine thread: {e}")))?;

    Ok(EngineHandle {
        sender,
        state,
        long_running,
        owner_connection,
        join: Arc::new(Mutex::new(Some(join))),
    })
}

impl Engine {
    fn run(mut self, runloop: Runloop<EngineTask>) {
        if let Err(err) = self.spawn_groups() {
            error!(graph = %self.graph.id, error = %err, "engine failed to start");
            let _ = self.state.set(EngineState::Failed(err.to_string()));
            self.join_groups();
            self.detach_from_app();
            return;
        }
        info!(graph = %self.graph.id, groups = self.groups.len(), "engine running");
        if self.starting_groups.is_empty() {
            let _ = self.state.set(EngineState::Ready);
        }

        loop {
            let deadline = self.next_deadline();
            match runloop.next_before(deadline) {
                Ok(Polled::Task(task)) => {
                    self.handle(task);
                    if runloop.task_done().is_err() {
                        break;
                    }
                }
                Ok(Polled::TimedOut) => {}
                Ok(Polled::Stopped) => break,
                Err(err) => {
                    error!(graph = %self.graph.id, error = %err, "engine loop error");
                    break;
                }
            }
            self.sweep(Instant::now());
            if self.ready_to_finalize() {
                self.finalize(&runloop);
            }
        }
        self.join_groups();
        // A start failure stays visible to wait_ready; everything else
        // ends at Closed.
        let _ = self.state.update(|s| {
            if !matches!(s, EngineState::Failed(_)) {
                *s = EngineState::Closed;
            }
        });
        debug!(graph = %self.graph.id, "engine closed");
    }

    fn spawn_groups(&mut self) -> Result<()> {
        for (group, extensions) in self.graph.local_groups() {
            let specs: Vec<ExtensionSpec> = extensions
                .iter()
                .filter_map(|name| self.graph.node(name))
                .map(|node| ExtensionSpec {
                    name: node.name.clone(),
                    addon: node.addon.clone(),
                    property: node.property.clone(),
                })
                .collect();
            let handle = GroupHandle::spawn(
                group.clone(),
                specs,
                self.sender.clone(),
                self.app_uri.clone(),
                Arc::clone(&self.registry),
            )?;
            self.starting_groups.insert(group.clone());
            self.groups.insert(group.clone(), handle);
        }
        Ok(())
    }

    fn handle(&mut self, task: EngineTask) {
        match task {
            EngineTask::Inbound { from, msg } => self.handle_inbound(from, msg),
            EngineTask::Outbound {
                from_ext,
                msg,
                expect,
            } => self.handle_outbound(&from_ext, msg, expect),
            EngineTask::Result(msg) => self.handle_result(msg),
            EngineTask::GroupStarted { group } => {
                self.starting_groups.remove(&group);
                if self.starting_groups.is_empty() && !self.closing {
                    let _ = self.state.set(EngineState::Ready);
                }
            }
            EngineTask::GroupStartFailed { group, error } => {
                error!(graph = %self.graph.id, %group, %error, "group failed to start");
                let _ = self
                    .state
                    .set(EngineState::Failed(format!("group {group:?}: {error}")));
                // The thread exited before serving tasks; it will never
                // answer a StopHooks post.
                self.starting_groups.remove(&group);
                self.stopped_groups.insert(group);
                self.begin_stop();
            }
            EngineTask::GroupStopped { group } => {
                self.stopped_groups.insert(group);
            }
            EngineTask::StartTimer {
                extension,
                name,
                interval,
                repeat,
            } => self.start_timer(extension, name, interval, repeat),
            EngineTask::StopTimer { extension, name } => {
                if let Some(id) = self.timer_keys.remove(&(extension, name)) {
                    if let Some(entry) = self.timers.get_mut(&id) {
                        entry.cancelled = true;
                    }
                }
            }
            EngineTask::Stop { reply } => self.handle_stop(reply, None),
        }
    }

    fn handle_inbound(&mut self, from: InboundFrom, msg: Message) {
        if msg.kind == MsgKind::CmdResult {
            self.handle_result(msg);
            return;
        }
        if self.closing {
            if msg.is_cmd() {
                let detail = format!("engine {} is closing", self.graph.id);
                self.deliver_terminal(Terminal {
                    responder: from.into_responder(),
                    results: vec![Message::error_result(msg.origin_path_id, &msg.name, &detail)],
                    origin_path: msg.origin_path_id,
                    cmd_name: msg.name,
                });
            } else {
                debug!(graph = %self.graph.id, name = %msg.name, "dropping inbound during close");
            }
            return;
        }
        match msg.kind {
            MsgKind::Cmd if msg.name == CMD_STOP_GRAPH => {
                self.handle_stop(Some(from.into_responder()), msg.origin_path_id)
            }
            MsgKind::Cmd | MsgKind::Timer => {
                let policy = if msg.destinations.len() > 1 {
                    ReturnPolicy::AllOrdered
                } else {
                    ReturnPolicy::FirstWins
                };
                let timeout = inbound_timeout(&msg);
                self.route_cmd(None, msg, from.into_responder(), policy, timeout);
            }
            MsgKind::Data | MsgKind::TimerTimeout => self.route_data(None, msg),
            MsgKind::CmdResult => unreachable!(),
        }
    }

    fn handle_outbound(&mut self, from_ext: &str, msg: Message, expect: Option<Expect>) {
        match expect {
            Some(expect) => {
                let responder = Responder::Handler {
                    group: expect.group,
                    extension: expect.extension,
                    handler: expect.handler,
                };
                self.route_cmd(Some(from_ext), msg, responder, expect.policy, expect.timeout);
            }
            None => self.route_data(Some(from_ext), msg),
        }
    }

    fn handle_result(&mut self, msg: Message) {
        if let Some(terminal) = self.table.on_result(msg) {
            self.deliver_terminal(terminal);
        }
    }

    /// Resolves the edge entries a message routes along: explicit
    /// destinations win; otherwise the graph's destination table for
    /// (sender, kind, name).
    fn resolve_entries(
        &self,
        from_ext: Option<&str>,
        msg: &Message,
    ) -> Vec<(Destination, Option<MsgConversion>)> {
        if !msg.destinations.is_empty() {
            return msg
                .destinations
                .iter()
                .map(|d| (d.clone(), None))
                .collect();
        }
        let Some(src) = from_ext else {
            return Vec::new();
        };
        self.graph
            .routes(src, msg.kind, &msg.name)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| (e.dest.clone(), e.conversion.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn route_cmd(
        &mut self,
        from_ext: Option<&str>,
        msg: Message,
        responder: Responder,
        policy: ReturnPolicy,
        timeout: Option<Duration>,
    ) {
        let entries = self.resolve_entries(from_ext, &msg);
        if entries.is_empty() {
            let detail = format!("no destination for command {:?}", msg.name);
            self.deliver_terminal(Terminal {
                responder,
                results: vec![Message::error_result(msg.origin_path_id, &msg.name, &detail)],
                cmd_name: msg.name.clone(),
                origin_path: msg.origin_path_id,
            });
            return;
        }
        let group_key = self.table.open_group(
            policy,
            responder,
            msg.name.clone(),
            msg.origin_path_id,
            timeout,
        );
        // All slots are reserved before the first delivery so a destination
        // failing synchronously cannot close the group while siblings are
        // still being attached.
        let mut slots = Vec::with_capacity(entries.len());
        for (dest, conversion) in entries {
            if let Some(path_id) = self.table.add_slot(group_key, conversion.clone()) {
                slots.push((path_id, dest, conversion));
            }
        }
        for (path_id, dest, conversion) in slots {
            // One independent clone per destination.
            let clone = self.make_clone(&msg, &dest, conversion.as_ref(), Some(path_id), from_ext);
            match clone {
                Ok(clone) => {
                    if let Err(err) = self.deliver_clone(&dest, clone) {
                        self.fail_slot(path_id, &msg.name, &err);
                    }
                }
                Err(err) => self.fail_slot(path_id, &msg.name, &err),
            }
        }
    }

    fn route_data(&mut self, from_ext: Option<&str>, msg: Message) {
        let entries = self.resolve_entries(from_ext, &msg);
        if entries.is_empty() {
            debug!(graph = %self.graph.id, name = %msg.name, "data message has no route");
            return;
        }
        for (dest, conversion) in entries {
            match self.make_clone(&msg, &dest, conversion.as_ref(), None, from_ext) {
                Ok(clone) => {
                    if let Err(err) = self.deliver_clone(&dest, clone) {
                        warn!(graph = %self.graph.id, name = %msg.name, error = %err, "data delivery failed");
                    }
                }
                Err(err) => {
                    warn!(graph = %self.graph.id, name = %msg.name, error = %err, "data conversion failed")
                }
            }
        }
    }

    fn make_clone(
        &self,
        msg: &Message,
        dest: &Destination,
        conversion: Option<&MsgConversion>,
        path_id: Option<PathId>,
        from_ext: Option<&str>,
    ) -> Result<Message> {
        let mut clone = match conversion {
            Some(conv) => conv.apply(msg)?,
            None => msg.duplicate(),
        };
        clone.destinations = vec![dest.clone()];
        clone.origin_path_id = path_id.or(clone.origin_path_id);
        if clone.source_extension.is_none() {
            clone.source_extension = from_ext.map(str::to_string);
        }
        Ok(clone)
    }

    /// Routing resolution order: app, then graph, then extension.
    fn deliver_clone(&mut self, dest: &Destination, msg: Message) -> Result<()> {
        // 1. A different app means the outbound transport takes over.
        if let Some(uri) = &dest.app_uri {
            if *uri != self.app_uri {
                return self.forward_remote(uri, msg);
            }
        }
        // 2. A graph id names either this engine or a sibling engine.
        if let Some(gid) = &dest.graph_id {
            let resolved = self.resolve_graph_id(gid)?;
            if resolved != self.graph.id {
                return self.forward_engine(&resolved, msg);
            }
        }
        // 3. The extension must be a node of this graph, and an explicit
        // group in the address must be the node's actual group.
        let ext_name = dest
            .extension
            .clone()
            .unwrap_or_default();
        let Some(group) = self.graph.group_of(&ext_name) else {
            return Err(PlexusError::extension_invalid(ext_name));
        };
        if let Some(want) = &dest.extension_group {
            if want != group {
                return Err(PlexusError::extension_invalid(format!("{want}::{ext_name}")));
            }
        }
        let handle = self
            .groups
            .get(group)
            .ok_or_else(|| PlexusError::extension_invalid(ext_name.clone()))?;
        handle.post(GroupTask::Deliver {
            extension: ext_name,
            msg,
        })
    }

    fn resolve_graph_id(&self, gid: &str) -> Result<String> {
        if is_reserved_graph_id(gid) {
            let app = self
                .app
                .upgrade()
                .ok_or_else(|| PlexusError::graph_not_found(gid))?;
            return app
                .singleton_graph_id()
                .ok_or_else(|| PlexusError::graph_not_found(gid));
        }
        Ok(gid.to_string())
    }

    fn forward_remote(&self, uri: &str, msg: Message) -> Result<()> {
        let app = self
            .app
            .upgrade()
            .ok_or_else(|| PlexusError::app_unreachable(uri))?;
        app.forward_remote(uri, WireMessage::from_message(&msg))
    }

    fn forward_engine(&self, graph_id: &str, msg: Message) -> Result<()> {
        let app = self
            .app
            .upgrade()
            .ok_or_else(|| PlexusError::graph_not_found(graph_id))?;
        let target = app
            .engines
            .get(graph_id)
            .ok_or_else(|| PlexusError::graph_not_found(graph_id))?;
        target.sender.post(EngineTask::Inbound {
            from: InboundFrom::Engine(self.sender.clone()),
            msg,
        })
    }

    /// Feeds an addressing failure into the slot as an error result, so the
    /// requester still gets its exactly-one terminal result.
    fn fail_slot(&mut self, path_id: PathId, cmd_name: &str, err: &PlexusError) {
        debug!(graph = %self.graph.id, cmd = %cmd_name, error = %err, "destination failed");
        let result = Message::error_result(Some(path_id), cmd_name, &err.to_string());
        if let Some(terminal) = self.table.on_result(result) {
            self.deliver_terminal(terminal);
        }
    }

    fn deliver_terminal(&mut self, terminal: Terminal) {
        match terminal.responder {
            Responder::Handler {
                group,
                extension,
                handler,
            } => {
                if let Some(handle) = self.groups.get(&group) {
                    let _ = handle.post(GroupTask::DeliverResult {
                        extension,
                        handler,
                        results: terminal.results,
                    });
                } else {
                    warn!(graph = %self.graph.id, %group, "terminal result for a gone group");
                }
            }
            Responder::Connection(conn_id) => {
                let result = merge_results(&terminal.cmd_name, terminal.origin_path, terminal.results);
                let Some(app) = self.app.upgrade() else {
                    return;
                };
                let conn = app.connections.get(&conn_id).map(|c| Arc::clone(c.value()));
                match conn {
                    Some(conn) => {
                        if let Err(err) = conn.send_to_peer(result) {
                            warn!(graph = %self.graph.id, %conn_id, error = %err, "peer send failed");
                        }
                    }
                    None => {
                        debug!(graph = %self.graph.id, %conn_id, "result for a closed connection")
                    }
                }
            }
            Responder::Engine(sender) => {
                let result = merge_results(&terminal.cmd_name, terminal.origin_path, terminal.results);
                let _ = sender.post(EngineTask::Result(result));
            }
            Responder::Channel(tx) => {
                let result = merge_results(&terminal.cmd_name, terminal.origin_path, terminal.results);
                let _ = tx.send(result);
            }
        }
    }

    fn start_timer(
        &mut self,
        extension: String,
        name: String,
        interval: Duration,
        repeat: Option<u32>,
    ) {
        let key = (extension.clone(), name.clone());
        // Re-arming replaces the previous timer of the same name.
        if let Some(old) = self.timer_keys.remove(&key) {
            if let Some(entry) = self.timers.get_mut(&old) {
                entry.cancelled = true;
            }
        }
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.insert(
            id,
            TimerEntry {
                extension,
                name,
                interval,
                remaining: repeat,
                cancelled: false,
            },
        );
        self.timer_keys.insert(key, id);
        self.timer_heap.push(Reverse((Instant::now() + interval, id)));
    }

    fn next_deadline(&self) -> Option<Instant> {
        let path = self.table.next_deadline();
        let timer = self.timer_heap.peek().map(|Reverse((at, _))| *at);
        match (path, timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn sweep(&mut self, now: Instant) {
        for terminal in self.table.expire_due(now) {
            self.deliver_terminal(terminal);
        }
        while let Some(Reverse((at, id))) = self.timer_heap.peek().copied() {
            if at > now {
                break;
            }
            self.timer_heap.pop();
            let Some(entry) = self.timers.get_mut(&id) else {
                continue;
            };
            if entry.cancelled {
                self.timers.remove(&id);
                continue;
            }
            let extension = entry.extension.clone();
            let name = entry.name.clone();
            let rearm = match &mut entry.remaining {
                Some(n) => {
                    *n = n.saturating_sub(1);
                    *n > 0
                }
                None => true,
            };
            if rearm {
                let next = at + entry.interval;
                self.timer_heap.push(Reverse((next, id)));
            } else {
                self.timers.remove(&id);
                self.timer_keys.remove(&(extension.clone(), name.clone()));
            }
            if let Some(group) = self.graph.group_of(&extension) {
                if let Some(handle) = self.groups.get(group) {
                    let _ = handle.post(GroupTask::Deliver {
                        extension: extension.clone(),
                        msg: Message::timer_timeout(&name),
                    });
                }
            }
        }
    }

    fn handle_stop(&mut self, reply: Option<Responder>, origin: Option<PathId>) {
        if self.closing {
            if let Some(responder) = reply {
                // Double-stop is reported to the second caller, not fatal.
                self.deliver_terminal(Terminal {
                    responder,
                    results: vec![Message::error_result(
                        origin,
                        CMD_STOP_GRAPH,
                        &format!("graph {} is already stopping", self.graph.id),
                    )],
                    cmd_name: CMD_STOP_GRAPH.to_string(),
                    origin_path: origin,
                });
            }
            return;
        }
        self.stop_reply = reply;
        self.stop_origin = origin;
        self.begin_stop();
    }

    fn begin_stop(&mut self) {
        if self.closing {
            return;
        }
        info!(graph = %self.graph.id, open_paths = self.table.open_paths(), "engine stopping");
        self.closing = true;
        let _ = self.state.set(EngineState::Closing);
        for handle in self.groups.values() {
            let _ = handle.post(GroupTask::StopHooks);
        }
    }

    /// Done stopping once every stop hook ran and every in-flight path
    /// completed or timed out.
    fn ready_to_finalize(&self) -> bool {
        self.closing
            && self.stopped_groups.len() == self.groups.len()
            && self.table.is_empty()
    }

    fn finalize(&mut self, runloop: &Runloop<EngineTask>) {
        self.detach_from_app();
        if let Some(responder) = self.stop_reply.take() {
            let origin = self.stop_origin.take();
            let mut result = Message::error_result(origin, CMD_STOP_GRAPH, "graph stopped");
            result.status_code = Some(StatusCode::Ok);
            self.deliver_terminal(Terminal {
                responder,
                results: vec![result],
                cmd_name: CMD_STOP_GRAPH.to_string(),
                origin_path: origin,
            });
        }
        let _ = runloop.request_stop();
    }

    fn detach_from_app(&self) {
        if let Some(app) = self.app.upgrade() {
            app.engine_gone(&self.graph.id);
        }
    }

    fn join_groups(&mut self) {
        for handle in self.groups.values() {
            let _ = handle.request_stop();
        }
        for (name, handle) in self.groups.iter_mut() {
            if let Err(err) = handle.join() {
                // Unbalanced lock mode and friends: fatal to that group,
                // reported here, and isolated from every other group.
                error!(graph = %self.graph.id, group = %name, error = %err, "group stopped uncleanly");
            }
        }
    }
}

/// Path deadline picked by an external requester via the `timeout_ms`
/// property. Zero and negative counts fall back to the table default.
fn inbound_timeout(msg: &Message) -> Option<Duration> {
    let ms = msg.properties.get("timeout_ms").and_then(Value::as_i64)?;
    match Timeout::from_millis(ms) {
        Timeout::After(d) => Some(d),
        Timeout::NoWait | Timeout::Never => None,
    }
}

/// Folds a terminal's results into the single message sent to an external
/// requester. Fan-out toward an external caller is wrapped into one result
/// carrying every reply under `"results"`.
fn merge_results(cmd_name: &str, origin: Option<PathId>, mut results: Vec<Message>) -> Message {
    let mut merged = if results.len() == 1 {
        results.remove(0)
    } else {
        let all_ok = results
            .iter()
            .all(|r| r.status_code == Some(StatusCode::Ok));
        let mut msg = Message::result_for(
            &Message::cmd(cmd_name),
            if all_ok { StatusCode::Ok } else { StatusCode::Error },
        );
        let entries: Vec<Value> = results
            .iter()
            .map(|r| {
                serde_json::json!({
                    "status_code": r.status_code.map(i32::from),
                    "properties": Value::Object(r.properties.clone()),
                })
            })
            .collect();
        msg.properties
            .insert("results".to_string(), Value::Array(entries));
        msg
    };
    // Engine-synthesized results come in already stamped; a None here must
    // not erase their correlation id.
    if origin.is_some() {
        merged.origin_path_id = origin;
    }
    merged
}
