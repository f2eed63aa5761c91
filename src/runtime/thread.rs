//! The extension group thread.
//!
//! Each extension group gets one dedicated OS thread owning the group's
//! extension instances; every callback runs there and nowhere else. Foreign
//! threads interact through [`ForeignGroupHandle`]: closures queued for
//! asynchronous execution, or lock mode for multi-step exclusive sequences.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::core::errors::{PlexusError, Result};
use crate::msg::{Message, MsgKind};
use crate::runtime::engine::{EngineSender, EngineTask};
use crate::runtime::extension::{AddonRegistry, Extension, ExtensionContext, ResultHandler};
use crate::runtime::runloop::Runloop;

/// One extension to instantiate on the group thread.
#[derive(Debug, Clone)]
pub struct ExtensionSpec {
    pub name: String,
    pub addon: String,
    pub property: Option<Value>,
}

pub enum GroupTask {
    /// Inbound message for one extension of the group.
    Deliver { extension: String, msg: Message },
    /// Terminal result(s) for a command this group's extension sent.
    DeliverResult {
        extension: String,
        handler: ResultHandler,
        results: Vec<Message>,
    },
    /// Foreign-thread closure, run at the owning thread's next opportunity.
    Foreign(Box<dyn FnOnce(&mut GroupCore) + Send>),
    /// Run every extension's stop hook; the thread keeps serving tasks
    /// afterwards until the engine terminates it.
    StopHooks,
}

/// The state owned by a group thread: its extensions plus the identity
/// needed to build callback contexts. Foreign threads reach it only through
/// the notify queue or lock mode.
pub struct GroupCore {
    name: String,
    app_uri: String,
    engine: EngineSender,
    extensions: Vec<(String, Box<dyn Extension>)>,
    foreign: Option<ForeignGroupHandle>,
    hooks_stopped: bool,
}

impl GroupCore {
    fn context(&self, extension: &str) -> ExtensionContext {
        ExtensionContext {
            engine: self.engine.clone(),
            extension: extension.to_string(),
            group: self.name.clone(),
            app_uri: self.app_uri.clone(),
            foreign: self.foreign.clone(),
        }
    }

    pub fn group_name(&self) -> &str {
        &self.name
    }

    /// Runs `f` against one named extension with a fresh context. Returns
    /// `None` when the extension is not part of this group.
    pub fn with_extension<R>(
        &mut self,
        extension: &str,
        f: impl FnOnce(&mut dyn Extension, &mut ExtensionContext) -> R,
    ) -> Option<R> {
        let mut ctx = self.context(extension);
        let ext = self
            .extensions
            .iter_mut()
            .find(|(name, _)| name == extension)
            .map(|(_, ext)| ext)?;
        Some(f(ext.as_mut(), &mut ctx))
    }

    fn dispatch(&mut self, extension: &str, msg: Message) {
        let origin = msg.origin_path_id;
        let msg_name = msg.name.clone();
        let needs_result = msg.is_cmd() && origin.is_some();
        let engine = self.engine.clone();
        let outcome = self.with_extension(extension, |ext, ctx| {
            catch_unwind(AssertUnwindSafe(|| match msg.kind {
                MsgKind::Cmd | MsgKind::Timer => ext.on_cmd(ctx, msg),
                MsgKind::Data => ext.on_data(ctx, msg),
                MsgKind::TimerTimeout => ext.on_timer(ctx, msg),
                MsgKind::CmdResult => Err(anyhow::anyhow!(
                    "cmd_result delivered as plain message"
                )),
            }))
        });
        let failure = match outcome {
            None => Some(format!("extension {extension:?} is not in this group")),
            Some(Ok(Ok(()))) => None,
            Some(Ok(Err(err))) => Some(format!("{err:#}")),
            Some(Err(panic)) => Some(panic_detail(&panic)),
        };
        if let Some(detail) = failure {
            // Scoped failure: this invocation only, the loop stays alive.
            error!(
                group = %self.name,
                extension,
                msg = %msg_name,
                %detail,
                "extension callback failed"
            );
            if needs_result {
                let result = Message::error_result(origin, &msg_name, &detail);
                if let Err(e) = engine.post(EngineTask::Result(result)) {
                    warn!(group = %self.name, error = %e, "failed to report callback failure");
                }
            }
        }
    }

    fn run_stop_hooks(&mut self) {
        if self.hooks_stopped {
            return;
        }
        self.hooks_stopped = true;
        let names: Vec<String> = self.extensions.iter().map(|(n, _)| n.clone()).collect();
        for name in names {
            let outcome = self.with_extension(&name, |ext, ctx| {
                catch_unwind(AssertUnwindSafe(|| ext.on_stop(ctx)))
            });
            match outcome {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(err))) => {
                    warn!(group = %self.name, extension = %name, error = %format!("{err:#}"), "stop hook failed")
                }
                Some(Err(panic)) => {
                    warn!(group = %self.name, extension = %name, detail = %panic_detail(&panic), "stop hook panicked")
                }
                None => {}
            }
        }
    }
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("extension panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("extension panicked: {s}")
    } else {
        "extension panicked".to_string()
    }
}

/// Cloneable handle a foreign thread may hold onto.
#[derive(Clone)]
pub struct ForeignGroupHandle {
    group: String,
    runloop: Runloop<GroupTask>,
    core: Weak<Mutex<GroupCore>>,
}

impl ForeignGroupHandle {
    pub fn group_name(&self) -> &str {
        &self.group
    }

    /// Queues a closure for asynchronous execution on the owning thread.
    /// FIFO per submitting thread; no cross-thread order promised.
    pub fn post(&self, f: impl FnOnce(&mut GroupCore) + Send + 'static) -> Result<()> {
        self.runloop.post(GroupTask::Foreign(Box::new(f)))
    }

    /// Enters lock mode: parks the owning loop at its next task boundary
    /// and grants this thread exclusive access until the guard drops.
    /// Nested acquisition from the holding thread is legal. Must not be
    /// called from the group's own thread, which already has access.
    pub fn lock_mode(&self) -> Result<LockModeGuard> {
        self.runloop.lock_acquire()?;
        Ok(LockModeGuard {
            handle: self.clone(),
            released: false,
        })
    }
}

/// Exclusive access token. Multi-step sequences through [`Self::with`]
/// cannot interleave with engine-driven work on the group.
pub struct LockModeGuard {
    handle: ForeignGroupHandle,
    released: bool,
}

impl LockModeGuard {
    pub fn with<R>(&mut self, f: impl FnOnce(&mut GroupCore) -> R) -> Result<R> {
        let core = self
            .handle
            .core
            .upgrade()
            .ok_or_else(|| PlexusError::lifecycle(self.handle.group.clone(), "group is gone"))?;
        let mut guard = core
            .lock()
            .map_err(|_| PlexusError::internal("group core mutex poisoned"))?;
        Ok(f(&mut guard))
    }

    /// Explicit release; `drop` does the same.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.handle.runloop.lock_release()
    }
}

impl Drop for LockModeGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.handle.runloop.lock_release() {
                error!(group = %self.handle.group, error = %e, "lock mode release failed");
            }
        }
    }
}

/// Engine-side handle to one running group thread.
pub struct GroupHandle {
    pub name: String,
    runloop: Runloop<GroupTask>,
    core: Arc<Mutex<GroupCore>>,
    join: Option<JoinHandle<Result<()>>>,
}

impl GroupHandle {
    /// Spawns the dedicated thread. Extension instantiation and `on_start`
    /// happen on that thread; it reports readiness to the engine via
    /// `GroupStarted` / `GroupStartFailed`.
    pub fn spawn(
        name: String,
        specs: Vec<ExtensionSpec>,
        engine: EngineSender,
        app_uri: String,
        registry: Arc<AddonRegistry>,
    ) -> Result<GroupHandle> {
        let runloop: Runloop<GroupTask> = Runloop::new();
        let core = Arc::new(Mutex::new(GroupCore {
            name: name.clone(),
            app_uri,
            engine,
            extensions: Vec::new(),
            foreign: None,
            hooks_stopped: false,
        }));
        {
            // GroupCore hands clones of this to extension contexts so an
            // extension can ship its group handle to a thread it spawns.
            let foreign = ForeignGroupHandle {
                group: name.clone(),
                runloop: runloop.clone(),
                core: Arc::downgrade(&core),
            };
            core.lock()
                .map_err(|_| PlexusError::internal("group core mutex poisoned"))?
                .foreign = Some(foreign);
        }

        let thread_core = Arc::clone(&core);
        let thread_loop = runloop.clone();
        let thread_name = format!("group-{name}");
        let join = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_group(thread_core, thread_loop, specs, registry))
            .map_err(|e| PlexusError::internal(format!("cannot spawn group thread: {e}")))?;

        Ok(GroupHandle {
            name,
            runloop,
            core,
            join: Some(join),
        })
    }

    pub fn post(&self, task: GroupTask) -> Result<()> {
        self.runloop.post(task)
    }

    pub fn foreign(&self) -> ForeignGroupHandle {
        ForeignGroupHandle {
            group: self.name.clone(),
            runloop: self.runloop.clone(),
            core: Arc::downgrade(&self.core),
        }
    }

    pub fn request_stop(&self) -> Result<()> {
        self.runloop.request_stop()
    }

    /// Joins the thread; an unbalanced lock mode surfaces here as the
    /// group's fatal lifecycle error.
    pub fn join(&mut self) -> Result<()> {
        match self.join.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| PlexusError::internal("group thread panicked"))?,
            None => Ok(()),
        }
    }
}

fn run_group(
    core: Arc<Mutex<GroupCore>>,
    runloop: Runloop<GroupTask>,
    specs: Vec<ExtensionSpec>,
    registry: Arc<AddonRegistry>,
) -> Result<()> {
    let (group_name, engine) = {
        let c = core.lock().map_err(|_| PlexusError::internal("group core mutex poisoned"))?;
        (c.name.clone(), c.engine.clone())
    };

    // Create extensions, then run their start hooks, all on this thread.
    if let Err(err) = start_extensions(&core, &specs, &registry) {
        let _ = engine.post(EngineTask::GroupStartFailed {
            group: group_name.clone(),
            error: err.to_string(),
        });
        return Err(err);
    }
    engine.post(EngineTask::GroupStarted {
        group: group_name.clone(),
    })?;
    info!(group = %group_name, "extension group started");

    while let Some(task) = runloop.next()? {
        {
            let mut c = core
                .lock()
                .map_err(|_| PlexusError::internal("group core mutex poisoned"))?;
            match task {
                GroupTask::Deliver { extension, msg } => c.dispatch(&extension, msg),
                GroupTask::DeliverResult {
                    extension,
                    handler,
                    results,
                } => {
                    let mut ctx = c.context(&extension);
                    if let Err(panic) =
                        catch_unwind(AssertUnwindSafe(|| handler(&mut ctx, results)))
                    {
                        error!(
                            group = %group_name,
                            extension = %extension,
                            detail = %panic_detail(&panic),
                            "result handler panicked"
                        );
                    }
                }
                GroupTask::Foreign(f) => f(&mut c),
                GroupTask::StopHooks => {
                    c.run_stop_hooks();
                    engine.post(EngineTask::GroupStopped {
                        group: group_name.clone(),
                    })?;
                }
            }
        }
        runloop.task_done()?;
    }

    debug!(group = %group_name, "extension group loop exited");
    let depth = runloop.lock_depth()?;
    if depth != 0 {
        return Err(PlexusError::lifecycle(
            group_name,
            format!("lock mode still held at group stop (depth {depth})"),
        ));
    }
    Ok(())
}

fn start_extensions(
    core: &Arc<Mutex<GroupCore>>,
    specs: &[ExtensionSpec],
    registry: &Arc<AddonRegistry>,
) -> Result<()> {
    let mut c = core
        .lock()
        .map_err(|_| PlexusError::internal("group core mutex poisoned"))?;
    for spec in specs {
        let ext = registry.create(&spec.addon, &spec.name, spec.property.as_ref())?;
        c.extensions.push((spec.name.clone(), ext));
    }
    let names: Vec<String> = c.extensions.iter().map(|(n, _)| n.clone()).collect();
    for name in names {
        let outcome = c.with_extension(&name, |ext, ctx| {
            catch_unwind(AssertUnwindSafe(|| ext.on_start(ctx)))
        });
        match outcome {
            Some(Ok(Ok(()))) => {}
            Some(Ok(Err(err))) => {
                return Err(PlexusError::internal(format!(
                    "extension {name:?} failed to start: {err:#}"
                )))
            }
            Some(Err(panic)) => {
                return Err(PlexusError::internal(format!(
                    "extension {name:?} panicked in on_start: {}",
                    panic_detail(&panic)
                )))
            }
            None => {}
        }
    }
    Ok(())
}
