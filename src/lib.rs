//! plexus is a message routing runtime for graphs of extensions.
//!
//! An [`App`] hosts engines, one per running graph. A graph wires named
//! extensions together with typed edges; commands travel forward along the
//! edges and their results travel back along the recorded return paths.
//! Each extension group runs on its own OS thread, and every cross-thread
//! interaction goes through a runloop or an explicit lock-mode hand-off.
//!
//! ```no_run
//! use std::sync::Arc;
//! use plexus::{App, AppConfig, AddonRegistry};
//!
//! # fn main() -> plexus::Result<()> {
//! let registry = Arc::new(AddonRegistry::new());
//! let app = App::new(AppConfig::default(), registry)?;
//! let graph = plexus::GraphDefinition::from_yaml(
//!     "nodes:\n  - name: echo\n    addon: echo\n",
//! )?;
//! let graph_id = app.start_graph(graph, false)?;
//! app.stop_graph(&graph_id)?;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod core;
pub mod graph;
pub mod msg;
pub mod runtime;

pub use app::config::{AppConfig, PredefinedGraph};
pub use app::connection::{ConnectionHandle, PeerLink};
pub use app::{App, RemoteTransport};
pub use crate::core::errors::{PlexusError, Result};
pub use crate::core::logging::init_tracing;
pub use crate::core::waitable::{Timeout, WaitOutcome, Waitable};
pub use graph::{Graph, GraphDefinition};
pub use msg::conversion::{ConversionRule, MsgConversion};
pub use msg::{Destination, Message, MsgKind, PathId, StatusCode, WireMessage};
pub use runtime::extension::{AddonRegistry, Extension, ExtensionContext};
pub use runtime::path_table::ReturnPolicy;
