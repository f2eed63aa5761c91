use std::sync::Once;

use tracing::Level;

static INIT: Once = Once::new();

/// Installs a fmt subscriber once per process. Tests and embedders call this;
/// repeated calls are no-ops so parallel test binaries do not race.
pub fn init_tracing(level: Level) {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_thread_names(true)
            .with_target(true)
            .try_init();
    });
}
