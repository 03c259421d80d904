//! Events delivered to the dialog usage manager

use sipdum_message::Message;

use crate::timer::DumTimeout;

/// Input of [`DialogUsageManager::process`](crate::manager::DialogUsageManager::process)
#[derive(Debug, Clone)]
pub enum DumEvent {
    /// A parsed message from the transport layer
    Incoming(Message),
    /// A timer fired
    Timeout(DumTimeout),
    /// The transport could not parse an inbound message
    ParseFailure { source: Option<std::net::SocketAddr>, reason: String },
    /// Late decision for a request parked by the server auth manager
    AuthResult { transaction_id: String, accepted: bool },
}

impl From<Message> for DumEvent {
    fn from(message: Message) -> Self {
        DumEvent::Incoming(message)
    }
}

impl From<DumTimeout> for DumEvent {
    fn from(timeout: DumTimeout) -> Self {
        DumEvent::Timeout(timeout)
    }
}
