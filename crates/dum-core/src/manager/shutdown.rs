//! Shutdown state machine
//!
//! ```text
//! Running ──shutdown()──▶ ShutdownRequested ──last set gone──▶ ShuttingDownStack ──▶ Shutdown
//! ```
//!
//! Requesting shutdown ends every dialog set. New `make_*` calls are refused
//! from then on, but inbound traffic keeps being processed so the peers'
//! answers to our BYEs, un-REGISTERs and CANCELs can complete the teardown.
//! When the last dialog set is gone the transport is told to stop and the
//! shutdown handler is notified exactly once.

use tracing::{debug, info, warn};

use super::DialogUsageManager;
use crate::dialog::DialogSetId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    /// Dialog sets are being ended
    ShutdownRequested,
    /// Transport told to stop
    ShuttingDownStack,
    /// Shutdown handler notified
    Shutdown,
}

impl DialogUsageManager {
    /// Request shutdown; returns the state reached so far
    ///
    /// The first call ends every dialog set. Later calls only report
    /// progress, which is driven by the responses still arriving.
    pub fn shutdown(&mut self) -> ShutdownState {
        if self.shutdown_state == ShutdownState::Running {
            info!("Shutting down with {} dialog sets", self.dialog_sets.len());
            self.shutdown_state = ShutdownState::ShutdownRequested;
            let sets: Vec<DialogSetId> = self.dialog_sets.keys().cloned().collect();
            for set in sets {
                if let Err(e) = self.end_dialog_set(&set) {
                    warn!("Failed to end dialog set {} during shutdown: {}", set, e);
                }
            }
            self.check_shutdown_progress();
        }
        self.shutdown_state
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.shutdown_state
    }

    pub(crate) fn is_running(&self) -> bool {
        self.shutdown_state == ShutdownState::Running
    }

    /// Advance the shutdown once no dialog set is left
    pub(crate) fn check_shutdown_progress(&mut self) {
        if self.shutdown_state != ShutdownState::ShutdownRequested || !self.dialog_sets.is_empty() {
            return;
        }
        debug!("All dialog sets gone, stopping transport");
        self.shutdown_state = ShutdownState::ShuttingDownStack;
        self.transport.shutdown();

        self.shutdown_state = ShutdownState::Shutdown;
        if let Some(handler) = self.handlers.shutdown.clone() {
            handler.on_dum_can_be_deleted();
        }
        info!("Dialog usage manager shut down");
    }
}
