use std::sync::{Arc, Once};

use parking_lot::Mutex;
use tracing_subscriber::{fmt, EnvFilter};

use tickgraph_core::TickFunctionSpec;

static INIT: Once = Once::new();

/// Install a test-captured subscriber once per test binary.
///
/// Set `TICKGRAPH_LOG=debug` to see the scheduler's own logs.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("TICKGRAPH_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
        fmt().with_env_filter(filter).with_test_writer().with_target(true).init();
    });
}

/// A tick function that appends `label` to `log` every time it ticks.
#[allow(dead_code)]
pub fn logging(label: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> TickFunctionSpec {
    let log = log.clone();
    TickFunctionSpec::new(label, move |_| log.lock().push(label))
}
