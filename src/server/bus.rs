//! Message bus seam
//!
//! The agent talks to the bus through `BusClient`; deliveries arrive as
//! `BusEvent`s on a channel polled by the dispatch loop.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum BusError {
    NotConnected,
    Rejected(String),
    Closed,
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::NotConnected => write!(f, "Bus client is not connected"),
            BusError::Rejected(msg) => write!(f, "Bus rejected request: {}", msg),
            BusError::Closed => write!(f, "Bus channel closed"),
        }
    }
}

impl std::error::Error for BusError {}

/// A message delivered to the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Published on a stream the agent consumes
    StreamDeliver {
        stream: String,
        subject: String,
        payload: Vec<u8>,
    },
    /// Sent directly to the agent's mailbox
    MailboxDeliver {
        sender: String,
        subject: String,
        frames: Vec<String>,
    },
}

/// A message the agent sends to a peer's mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub recipient: String,
    pub subject: String,
    pub frames: Vec<String>,
}

#[async_trait]
pub trait BusClient: Send {
    async fn connect(&mut self, endpoint: &str, name: &str) -> Result<(), BusError>;

    async fn set_producer(&mut self, stream: &str) -> Result<(), BusError>;

    async fn set_consumer(&mut self, stream: &str, pattern: &str) -> Result<(), BusError>;

    async fn send_to(
        &mut self,
        recipient: &str,
        subject: &str,
        frames: Vec<String>,
    ) -> Result<(), BusError>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// Session state established through control commands
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusSession {
    pub endpoint: Option<String>,
    pub name: Option<String>,
    pub producer: Option<String>,
    pub consumers: Vec<(String, String)>,
}

/// In-process bus: outbound mailbox messages go to an mpsc receiver
pub struct ChannelBus {
    session: Arc<Mutex<BusSession>>,
    outbound: mpsc::Sender<OutboundMessage>,
}

impl ChannelBus {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let bus = Self {
            session: Arc::new(Mutex::new(BusSession::default())),
            outbound: tx,
        };
        (bus, rx)
    }

    /// Shared view of the session, readable after the bus moved into the server
    pub fn session(&self) -> Arc<Mutex<BusSession>> {
        self.session.clone()
    }

    fn with_session<R>(&self, f: impl FnOnce(&mut BusSession) -> R) -> R {
        let mut session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut session)
    }
}

#[async_trait]
impl BusClient for ChannelBus {
    async fn connect(&mut self, endpoint: &str, name: &str) -> Result<(), BusError> {
        if endpoint.is_empty() || name.is_empty() {
            return Err(BusError::Rejected(format!(
                "connect (endpoint = '{}', address = '{}')",
                endpoint, name
            )));
        }
        self.with_session(|s| {
            s.endpoint = Some(endpoint.to_string());
            s.name = Some(name.to_string());
        });
        Ok(())
    }

    async fn set_producer(&mut self, stream: &str) -> Result<(), BusError> {
        self.with_session(|s| {
            if s.endpoint.is_none() {
                return Err(BusError::NotConnected);
            }
            s.producer = Some(stream.to_string());
            Ok(())
        })
    }

    async fn set_consumer(&mut self, stream: &str, pattern: &str) -> Result<(), BusError> {
        self.with_session(|s| {
            if s.endpoint.is_none() {
                return Err(BusError::NotConnected);
            }
            s.consumers.push((stream.to_string(), pattern.to_string()));
            Ok(())
        })
    }

    async fn send_to(
        &mut self,
        recipient: &str,
        subject: &str,
        frames: Vec<String>,
    ) -> Result<(), BusError> {
        if self.with_session(|s| s.endpoint.is_none()) {
            return Err(BusError::NotConnected);
        }
        self.outbound
            .send(OutboundMessage {
                recipient: recipient.to_string(),
                subject: subject.to_string(),
                frames,
            })
            .await
            .map_err(|_| BusError::Closed)
    }

    fn backend_type(&self) -> &'static str {
        "channel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_recorded() {
        let (mut bus, _rx) = ChannelBus::new(4);
        let session = bus.session();

        assert!(matches!(bus.set_consumer("ASSETS", ".*").await, Err(BusError::NotConnected)));

        bus.connect("ipc://@/malamute", "fty-metric-store").await.unwrap();
        bus.set_consumer("ASSETS", ".*").await.unwrap();
        bus.set_producer("METRICS").await.unwrap();

        let session = session.lock().unwrap().clone();
        assert_eq!(session.name.as_deref(), Some("fty-metric-store"));
        assert_eq!(session.producer.as_deref(), Some("METRICS"));
        assert_eq!(session.consumers, vec![("ASSETS".to_string(), ".*".to_string())]);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (mut bus, mut rx) = ChannelBus::new(4);
        let frames = vec!["42".to_string(), "OK".to_string()];

        assert!(bus.send_to("ui", "aggregated data", frames.clone()).await.is_err());

        bus.connect("ipc://@/malamute", "fty-metric-store").await.unwrap();
        bus.send_to("ui", "aggregated data", frames.clone()).await.unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.recipient, "ui");
        assert_eq!(message.frames, frames);
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_name() {
        let (mut bus, _rx) = ChannelBus::new(1);
        assert!(matches!(bus.connect("ipc://@/malamute", "").await, Err(BusError::Rejected(_))));
    }
}
