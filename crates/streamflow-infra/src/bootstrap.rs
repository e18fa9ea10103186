//! Process start-up: logging first, then configuration, then the engine.

use std::path::Path;

use streamflow_core::engine::{EngineDeps, FlowEngine};
use streamflow_core::repository::DefinitionRepository;
use streamflow_observe::tracing_setup::init_tracing;

use crate::config::load_engine_config;

/// Install the global tracing subscriber, load `{config_dir}/streamflow.toml`
/// and start a [`FlowEngine`] over `deps`.
///
/// Tracing goes first so warnings from the config loader are not lost. A
/// subscriber installed earlier by the host process is kept.
pub async fn start_engine<R>(
    config_dir: &Path,
    json_logs: bool,
    deps: EngineDeps<R>,
) -> FlowEngine<R>
where
    R: DefinitionRepository + 'static,
{
    if let Err(err) = init_tracing(json_logs) {
        tracing::debug!(error = %err, "tracing already initialized, keeping existing subscriber");
    }

    let config = load_engine_config(config_dir).await;
    tracing::info!(
        config_dir = %config_dir.display(),
        max_entries = config.cache.max_entries,
        idle_ttl_secs = config.cache.idle_ttl_secs,
        straggler_timeout_secs = ?config.join.straggler_timeout_secs,
        operator_timeout_secs = config.task.operator_timeout_secs,
        "engine configuration loaded"
    );
    FlowEngine::start(&config, deps)
}
