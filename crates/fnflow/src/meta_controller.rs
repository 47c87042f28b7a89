//! Composes the individual controllers into one supervised unit with a
//! shared shutdown signal.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::controller::{InvocationController, WorkflowController};

/// Owns the controller tasks and a shutdown channel. Dropping the handle
/// does not stop the controllers — call [`MetaController::shutdown`] for a
/// graceful stop.
pub struct MetaController {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl MetaController {
    /// Spawns whichever controllers are `Some`. A controller disabled via
    /// `controller.invocation.enabled`/`controller.workflow.enabled` is
    /// passed as `None` and simply never gets a tick loop — its aggregates
    /// sit untouched in the cache until another process (or a later
    /// `bootstrap` with the flag flipped back on) picks them up.
    pub fn spawn(invocation_controller: Option<Arc<InvocationController>>, workflow_controller: Option<Arc<WorkflowController>>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        if let Some(invocation_controller) = invocation_controller {
            handles.push(tokio::spawn(invocation_controller.run(shutdown_rx.clone())));
        }
        if let Some(workflow_controller) = workflow_controller {
            handles.push(tokio::spawn(workflow_controller.run(shutdown_rx)));
        }

        Self { shutdown_tx, handles }
    }

    /// Signals every controller to stop after its current tick and waits
    /// for them to exit.
    pub async fn shutdown(self) {
        info!("meta-controller shutting down");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
