//! Shared state for the admin surface.
//!
//! Handlers receive `State<Arc<AppState>>`; everything mutable lives in the
//! store or behind the scheduler-status lock, so this module owns nothing
//! async itself.

use sqlx::SqlitePool;
use std::sync::Arc;

use tdk_config::PipelineConfig;
use tdk_queue::QueueBroker;
use tdk_research::ResearchCoordinator;
use tdk_scheduler::SharedSchedulerStatus;

/// Static build metadata included in health responses.
#[derive(Clone, Copy, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub broker: QueueBroker,
    pub scheduler_status: SharedSchedulerStatus,
    /// Force path for `POST /groups/{id}/articles`.
    pub research: Arc<ResearchCoordinator>,
    pub config: PipelineConfig,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(
        pool: SqlitePool,
        broker: QueueBroker,
        scheduler_status: SharedSchedulerStatus,
        research: Arc<ResearchCoordinator>,
        config: PipelineConfig,
    ) -> Self {
        AppState {
            pool,
            broker,
            scheduler_status,
            research,
            config,
            build: BuildInfo {
                service: "tdk-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}
