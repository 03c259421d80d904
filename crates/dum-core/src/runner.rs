//! Event loop driving a [`DialogUsageManager`]
//!
//! The manager itself is synchronous. [`DumRunner`] owns it on a tokio task
//! and feeds it, one at a time, everything posted through a [`DumSender`]
//! plus the timeouts coming due in its timer queue. Closing every sender
//! requests shutdown; the loop returns the manager once shutdown completes.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use sipdum_message::Message;

use crate::events::DumEvent;
use crate::manager::{DialogUsageManager, ShutdownState};

/// Upper bound on an idle wait with no timer pending
const IDLE_WAIT: Duration = Duration::from_secs(3600);

type Job = Box<dyn FnOnce(&mut DialogUsageManager) + Send>;

enum Input {
    Event(DumEvent),
    Execute(Job),
    Shutdown,
}

/// Cloneable entry point into a running manager
#[derive(Clone)]
pub struct DumSender {
    tx: mpsc::UnboundedSender<Input>,
}

impl DumSender {
    /// Deliver an event; `false` once the runner has stopped
    pub fn post(&self, event: impl Into<DumEvent>) -> bool {
        self.tx.send(Input::Event(event.into())).is_ok()
    }

    /// Hand an inbound message to the manager
    pub fn incoming(&self, message: Message) -> bool {
        self.post(DumEvent::Incoming(message))
    }

    /// Run `job` on the manager's task, e.g. to act on a usage handle
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce(&mut DialogUsageManager) + Send + 'static,
    {
        self.tx.send(Input::Execute(Box::new(job))).is_ok()
    }

    /// Request shutdown without waiting for the senders to close
    pub fn shutdown(&self) -> bool {
        self.tx.send(Input::Shutdown).is_ok()
    }
}

/// Owns a manager and serializes all work on it
pub struct DumRunner {
    dum: DialogUsageManager,
    rx: mpsc::UnboundedReceiver<Input>,
}

impl DumRunner {
    pub fn new(dum: DialogUsageManager) -> (Self, DumSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { dum, rx }, DumSender { tx })
    }

    pub fn manager(&self) -> &DialogUsageManager {
        &self.dum
    }

    pub fn manager_mut(&mut self) -> &mut DialogUsageManager {
        &mut self.dum
    }

    /// Process events and timers until the manager has shut down
    pub async fn run(mut self) -> DialogUsageManager {
        info!("Dialog usage manager running");
        let mut inputs_open = true;

        while self.dum.shutdown_state() != ShutdownState::Shutdown {
            let deadline = self.dum.next_timer_deadline();
            if !inputs_open && deadline.is_none() {
                warn!(
                    "Inputs closed with {} dialog sets left and no timer pending, giving up",
                    self.dum.dialog_set_count()
                );
                break;
            }
            let wake = deadline.unwrap_or_else(|| Instant::now() + IDLE_WAIT);

            tokio::select! {
                input = self.rx.recv(), if inputs_open => match input {
                    Some(Input::Event(event)) => self.dum.process(event),
                    Some(Input::Execute(job)) => job(&mut self.dum),
                    Some(Input::Shutdown) => {
                        self.dum.shutdown();
                    }
                    None => {
                        debug!("All senders dropped, shutting down");
                        inputs_open = false;
                        self.dum.shutdown();
                    }
                },
                _ = sleep_until(wake) => {
                    let fired = self.dum.process_timers();
                    trace!("{} timers fired", fired);
                }
            }
        }

        info!("Dialog usage manager stopped");
        self.dum
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::DumConfig;
    use crate::transport::{ChannelTransport, TransportCommand};

    #[tokio::test]
    async fn test_runner_stops_when_senders_close() {
        let (transport, mut commands) = ChannelTransport::new();
        let dum = DialogUsageManager::new(DumConfig::default(), Arc::new(transport));
        let (runner, sender) = DumRunner::new(dum);
        let task = tokio::spawn(runner.run());

        assert!(sender.execute(|dum| assert_eq!(dum.dialog_set_count(), 0)));
        drop(sender);

        let dum = task.await.unwrap();
        assert_eq!(dum.shutdown_state(), ShutdownState::Shutdown);
        assert!(matches!(commands.recv().await, Some(TransportCommand::Shutdown)));
    }
}
