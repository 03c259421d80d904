//! Transport seam
//!
//! The manager hands fully decorated messages to a [`SipTransport`] and
//! never waits for it: delivery failures come back later as events (a 408
//! from the transaction layer, for instance), not as return values.
//!
//! [`ChannelTransport`] is the transport used with
//! [`DumRunner`](crate::runner::DumRunner): it forwards every command to a
//! tokio channel drained by the real network task.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use sipdum_message::Message;

/// Outbound side of the transport layer
pub trait SipTransport: Send + Sync {
    /// Send to the destination derived from the message itself
    fn send(&self, message: Message);

    /// Send to an explicit destination
    fn send_to(&self, message: Message, destination: SocketAddr);

    /// Stop accepting work; called once during manager shutdown
    fn shutdown(&self);
}

/// A command for the network task
#[derive(Debug, Clone)]
pub enum TransportCommand {
    Send(Message),
    SendTo(Message, SocketAddr),
    Shutdown,
}

/// [`SipTransport`] that forwards commands over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<TransportCommand>,
}

impl ChannelTransport {
    /// Create a transport and the receiver the network task drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, command: TransportCommand) {
        if let Err(e) = self.tx.send(command) {
            warn!("Transport channel closed, dropping {:?}", e.0);
        }
    }
}

impl SipTransport for ChannelTransport {
    fn send(&self, message: Message) {
        debug!("Sending {}", message.brief());
        self.forward(TransportCommand::Send(message));
    }

    fn send_to(&self, message: Message, destination: SocketAddr) {
        debug!("Sending {} to {}", message.brief(), destination);
        self.forward(TransportCommand::SendTo(message, destination));
    }

    fn shutdown(&self) {
        self.forward(TransportCommand::Shutdown);
    }
}
