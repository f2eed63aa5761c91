//! Command/result correlation.
//!
//! Sending a command to N destinations creates one pending group with N
//! slots; every outgoing clone carries its own path id. Results are matched
//! back O(1) by path id, rewritten by the edge's result-direction rules, and
//! delivered to the group's responder exactly once: first-wins delivers the
//! first result, aggregation buffers all N in arrival order, and an elapsed
//! deadline synthesizes a single timeout result. Late arrivals after close
//! are dropped silently.
//!
//! The table is owned by its engine's thread; cross-thread results are
//! marshalled through the engine runloop, so no internal locking exists.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::msg::conversion::MsgConversion;
use crate::msg::{Message, PathId};
use crate::runtime::extension::ResultHandler;

/// Detail string of a synthesized timeout result.
pub const TIMEOUT_DETAIL: &str = "Operation timed out.";

/// Default deadline for paths whose sender did not pick one.
pub const DEFAULT_PATH_TIMEOUT: Duration = Duration::from_secs(10);

/// How a closed group hands its result(s) to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnPolicy {
    /// Deliver the first result, close, drop the rest. Default for
    /// single-destination callback sends.
    FirstWins,
    /// Buffer until all awaited results arrive; deliver in arrival order.
    AllOrdered,
}

/// Where the terminal result(s) of a group go.
pub enum Responder {
    /// Callback on the sending extension's group thread.
    Handler {
        group: String,
        extension: String,
        handler: ResultHandler,
    },
    /// Forward out over a connection, stamped with the original path id.
    Connection(Uuid),
    /// Another engine in this app posted the command.
    Engine(crate::runtime::engine::EngineSender),
    /// A blocking in-process requester (dispatcher, embedder, tests).
    Channel(std::sync::mpsc::Sender<Message>),
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handler {
                group, extension, ..
            } => write!(f, "Handler({group}/{extension})"),
            Self::Connection(id) => write!(f, "Connection({id})"),
            Self::Engine(s) => write!(f, "Engine({})", s.graph_id),
            Self::Channel(_) => write!(f, "Channel"),
        }
    }
}

/// A closed group ready for delivery.
#[derive(Debug)]
pub struct Terminal {
    pub responder: Responder,
    pub results: Vec<Message>,
    pub cmd_name: String,
    /// Path id of the command as the requester sent it, echoed back on the
    /// outgoing result(s).
    pub origin_path: Option<PathId>,
}

#[derive(Debug)]
struct Slot {
    group_key: u64,
    result_conversion: Option<MsgConversion>,
}

struct PendingGroup {
    policy: ReturnPolicy,
    awaited: usize,
    received: Vec<Message>,
    responder: Responder,
    cmd_name: String,
    origin_path: Option<PathId>,
    slot_ids: Vec<PathId>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    deadline: Instant,
}

/// Per-engine path table.
#[derive(Default)]
pub struct PathTable {
    slots: HashMap<PathId, Slot>,
    groups: HashMap<u64, PendingGroup>,
    next_group_key: u64,
}

impl PathTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a pending group. Slots are attached afterwards, one per clone.
    pub fn open_group(
        &mut self,
        policy: ReturnPolicy,
        responder: Responder,
        cmd_name: impl Into<String>,
        origin_path: Option<PathId>,
        timeout: Option<Duration>,
    ) -> u64 {
        let key = self.next_group_key;
        self.next_group_key += 1;
        self.groups.insert(
            key,
            PendingGroup {
                policy,
                awaited: 0,
                received: Vec::new(),
                responder,
                cmd_name: cmd_name.into(),
                origin_path,
                slot_ids: Vec::new(),
                created_at: Utc::now(),
                deadline: Instant::now() + timeout.unwrap_or(DEFAULT_PATH_TIMEOUT),
            },
        );
        key
    }

    /// Attaches one clone's path id to its group. Path ids are fresh uuids,
    /// never reused while any group is open. Returns `None` when the group
    /// already closed (an earlier slot raced it shut).
    pub fn add_slot(
        &mut self,
        group_key: u64,
        result_conversion: Option<MsgConversion>,
    ) -> Option<PathId> {
        let Some(group) = self.groups.get_mut(&group_key) else {
            debug!(group_key, "slot requested for a closed group");
            return None;
        };
        let path_id = Uuid::new_v4();
        group.awaited += 1;
        group.slot_ids.push(path_id);
        self.slots.insert(
            path_id,
            Slot {
                group_key,
                result_conversion,
            },
        );
        Some(path_id)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn open_paths(&self) -> usize {
        self.slots.len()
    }

    /// Matches an arriving result against its slot. Returns the terminal
    /// delivery when this arrival closes the group.
    pub fn on_result(&mut self, mut result: Message) -> Option<Terminal> {
        let path_id = result.origin_path_id?;
        let Some(slot) = self.slots.get(&path_id) else {
            debug!(%path_id, name = %result.name, "late or unknown result dropped");
            return None;
        };
        let group_key = slot.group_key;
        if let Some(conv) = &slot.result_conversion {
            match conv.apply_result(&result) {
                Ok(Some(rewritten)) => result = rewritten,
                Ok(None) => {}
                Err(err) => {
                    result = Message::error_result(
                        Some(path_id),
                        &result.name,
                        &format!("result conversion failed: {err}"),
                    );
                }
            }
        }
        let group = self.groups.get_mut(&group_key)?;
        match group.policy {
            ReturnPolicy::FirstWins => self.close_group(group_key, vec![result]),
            ReturnPolicy::AllOrdered => {
                group.received.push(result);
                if group.received.len() >= group.awaited {
                    let results = std::mem::take(&mut group.received);
                    self.close_group(group_key, results)
                } else {
                    // This slot is spent; keep siblings alive.
                    group.slot_ids.retain(|id| *id != path_id);
                    self.slots.remove(&path_id);
                    None
                }
            }
        }
    }

    fn close_group(&mut self, group_key: u64, results: Vec<Message>) -> Option<Terminal> {
        let group = self.groups.remove(&group_key)?;
        for id in &group.slot_ids {
            self.slots.remove(id);
        }
        Some(Terminal {
            responder: group.responder,
            results,
            cmd_name: group.cmd_name,
            origin_path: group.origin_path,
        })
    }

    /// Closes every group whose deadline has elapsed, synthesizing one
    /// timeout result each. Late real results will find no slot and drop.
    pub fn expire_due(&mut self, now: Instant) -> Vec<Terminal> {
        let due: Vec<u64> = self
            .groups
            .iter()
            .filter(|(_, g)| g.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        due.into_iter()
            .filter_map(|key| {
                let (name, origin) = {
                    let g = self.groups.get(&key)?;
                    (g.cmd_name.clone(), g.origin_path)
                };
                debug!(cmd = %name, "path group timed out");
                let timeout_result = Message::error_result(origin, &name, TIMEOUT_DETAIL);
                self.close_group(key, vec![timeout_result])
            })
            .collect()
    }

    /// Earliest open deadline, for clamping the engine loop's wait.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.groups.values().map(|g| g.deadline).min()
    }
}
