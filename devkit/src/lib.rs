/*!
# Responder DevKit - test doubles for the orchestrator

Helpers that let the orchestrator's tests run without a lab network:
- a real HTTP mock of the planning service (records every request)
- a writer for the newline-delimited alert feed (append, truncate, rotate)
- builders for alert JSON in the shapes the detection engine emits
*/

pub mod alert_builder;
pub mod feed_writer;
pub mod mock_planner;

pub use alert_builder::AlertBuilder;
pub use feed_writer::FeedWriter;
pub use mock_planner::MockPlanner;

use tracing_subscriber::EnvFilter;

/// Install a test-captured tracing subscriber once; later calls are no-ops.
/// `log` records (the devkit's own) are bridged into it, so both the
/// orchestrator's spans/events and the mocks' messages show up with
/// `RUST_LOG` set.
pub fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .try_init()
        .ok();
}
