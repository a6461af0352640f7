// Kernel - core infrastructure services
//
// The SyncRuntime holds the process-wide dependencies (metadata store,
// crypto, progress bus, status controller) that the scheduler, supervisor
// and orchestrator share.
//
// IMPORTANT: Kernel is for INFRASTRUCTURE only, not business logic.
// Entity queries belong in the domain models.

pub mod progress;
pub mod scheduler;
pub mod status;
pub mod supervisor;
pub mod sync;

use std::sync::Arc;

use sqlx::PgPool;

use crate::common::CryptoService;
use crate::config::Config;

pub use progress::{ProgressBus, ProgressEvent};
pub use scheduler::SyncScheduler;
pub use status::StatusController;
pub use supervisor::RunOutcome;

/// Process-wide services shared by every run.
pub struct SyncRuntime {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub crypto: Arc<CryptoService>,
    pub progress: ProgressBus,
    pub status: StatusController,
}

impl SyncRuntime {
    pub fn new(pool: PgPool, config: Arc<Config>, crypto: Arc<CryptoService>) -> Self {
        let status = StatusController::new(pool.clone());
        Self {
            pool,
            config,
            crypto,
            progress: ProgressBus::new(),
            status,
        }
    }
}
