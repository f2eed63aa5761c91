//! The extension-facing API surface.
//!
//! Extensions are synchronous callbacks invoked only on their group's
//! dedicated thread. The [`ExtensionContext`] handed to every callback is
//! the sole way to emit messages; all sends are marshalled through the
//! owning engine's runloop.

use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

use crate::core::errors::{PlexusError, Result};
use crate::msg::{Message, MsgKind};
use crate::runtime::engine::{EngineSender, EngineTask, Expect};
use crate::runtime::path_table::ReturnPolicy;

/// User-supplied message-handling logic. Callbacks return `anyhow::Result`
/// so extension code can bubble its own error types; a failure (or panic)
/// is scoped to that one invocation.
pub trait Extension: Send + 'static {
    fn on_start(&mut self, _ctx: &mut ExtensionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_cmd(&mut self, ctx: &mut ExtensionContext, cmd: Message) -> anyhow::Result<()>;

    fn on_data(&mut self, _ctx: &mut ExtensionContext, _data: Message) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_timer(&mut self, _ctx: &mut ExtensionContext, _timeout: Message) -> anyhow::Result<()> {
        Ok(())
    }

    /// Stop hook. May still send commands; the engine does not consider the
    /// group done until those commands complete too.
    fn on_stop(&mut self, _ctx: &mut ExtensionContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Terminal result callback, run on the sending extension's thread.
pub type ResultHandler = Box<dyn FnOnce(&mut ExtensionContext, Vec<Message>) + Send>;

/// Per-invocation context identifying the running extension and its engine.
pub struct ExtensionContext {
    pub(crate) engine: EngineSender,
    pub(crate) extension: String,
    pub(crate) group: String,
    pub(crate) app_uri: String,
    pub(crate) foreign: Option<crate::runtime::thread::ForeignGroupHandle>,
}

impl ExtensionContext {
    pub fn extension_name(&self) -> &str {
        &self.extension
    }

    /// Handle a spawned thread may keep: the only legal way for a foreign
    /// thread to reach back into this group.
    pub fn foreign_handle(&self) -> Result<crate::runtime::thread::ForeignGroupHandle> {
        self.foreign
            .clone()
            .ok_or_else(|| PlexusError::internal("context has no group handle"))
    }

    pub fn group_name(&self) -> &str {
        &self.group
    }

    pub fn graph_id(&self) -> &str {
        &self.engine.graph_id
    }

    pub fn app_uri(&self) -> &str {
        &self.app_uri
    }

    /// Sends a command expecting a single reply: first result wins, later
    /// ones are discarded by the path table.
    pub fn send_cmd(
        &mut self,
        cmd: Message,
        handler: impl FnOnce(&mut ExtensionContext, Message) + Send + 'static,
    ) -> Result<()> {
        self.submit_cmd(
            cmd,
            ReturnPolicy::FirstWins,
            None,
            Box::new(move |ctx, results| {
                if let Some(first) = results.into_iter().next() {
                    handler(ctx, first);
                }
            }),
        )
    }

    /// Explicit fan-out: buffers until every destination replied (or the
    /// deadline fires) and delivers the results in arrival order.
    pub fn send_cmd_all(
        &mut self,
        cmd: Message,
        handler: impl FnOnce(&mut ExtensionContext, Vec<Message>) + Send + 'static,
    ) -> Result<()> {
        self.submit_cmd(cmd, ReturnPolicy::AllOrdered, None, Box::new(handler))
    }

    /// Full-control send: policy and per-path deadline.
    pub fn submit_cmd(
        &mut self,
        cmd: Message,
        policy: ReturnPolicy,
        timeout: Option<Duration>,
        handler: ResultHandler,
    ) -> Result<()> {
        if !cmd.is_cmd() {
            return Err(PlexusError::validation(format!(
                "submit_cmd called with a {:?} message",
                cmd.kind
            )));
        }
        self.engine.post(EngineTask::Outbound {
            from_ext: self.extension.clone(),
            msg: cmd,
            expect: Some(Expect {
                policy,
                timeout,
                group: self.group.clone(),
                extension: self.extension.clone(),
                handler,
            }),
        })
    }

    /// Fire-and-forget data along declared edges.
    pub fn send_data(&mut self, data: Message) -> Result<()> {
        self.engine.post(EngineTask::Outbound {
            from_ext: self.extension.clone(),
            msg: data,
            expect: None,
        })
    }

    /// Returns a result toward whoever sent the command. The result must
    /// carry the command's path id (`Message::result_for` does).
    pub fn return_result(&mut self, result: Message) -> Result<()> {
        if result.kind != MsgKind::CmdResult {
            return Err(PlexusError::validation(
                "return_result requires a cmd_result message",
            ));
        }
        if result.origin_path_id.is_none() {
            return Err(PlexusError::validation(
                "return_result requires the originating path id",
            ));
        }
        self.engine.post(EngineTask::Result(result))
    }

    /// Arms a timer serviced by the engine thread; each firing delivers a
    /// `timer_timeout` message named `name` back to this extension.
    /// `repeat = None` fires until stopped.
    pub fn start_timer(
        &mut self,
        name: impl Into<String>,
        interval: Duration,
        repeat: Option<u32>,
    ) -> Result<()> {
        self.engine.post(EngineTask::StartTimer {
            extension: self.extension.clone(),
            name: name.into(),
            interval,
            repeat,
        })
    }

    pub fn stop_timer(&mut self, name: impl Into<String>) -> Result<()> {
        self.engine.post(EngineTask::StopTimer {
            extension: self.extension.clone(),
            name: name.into(),
        })
    }
}

/// Factory producing an extension instance for one graph node.
pub type ExtensionFactory =
    dyn Fn(&str, Option<&Value>) -> anyhow::Result<Box<dyn Extension>> + Send + Sync;

/// Named factories by addon id; graph nodes reference addons, and the group
/// thread instantiates its extensions through this registry at start.
#[derive(Default)]
pub struct AddonRegistry {
    addons: DashMap<String, Arc<ExtensionFactory>>,
}

impl AddonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, addon: impl Into<String>, factory: F)
    where
        F: Fn(&str, Option<&Value>) -> anyhow::Result<Box<dyn Extension>> + Send + Sync + 'static,
    {
        self.addons.insert(addon.into(), Arc::new(factory));
    }

    pub fn create(
        &self,
        addon: &str,
        extension_name: &str,
        property: Option<&Value>,
    ) -> Result<Box<dyn Extension>> {
        let factory = self.addons.get(addon).ok_or_else(|| {
            PlexusError::validation_field(format!("unknown addon {addon:?}"), addon)
        })?;
        factory(extension_name, property)
            .map_err(|e| PlexusError::internal(format!("addon {addon:?} failed: {e:#}")))
    }

    pub fn contains(&self, addon: &str) -> bool {
        self.addons.contains_key(addon)
    }
}
