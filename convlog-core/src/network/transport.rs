/// Transport seam and the in-process implementation.
///
/// A `Transport` opens a named channel to a peer device. A `Channel` answers
/// the two questions a fetch asks: what is your head, and which commits
/// lead to it that I lack. The responder side decides through a
/// `ChannelAcceptor` registered for the channel scheme.
///
/// `LocalNetwork` routes channels between `LocalTransport`s living in one
/// process. Every envelope crosses it as bytes, so peers never share
/// decoded objects.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use convlog_protocol::conversation::{CommitEnvelope, CommitId, DeviceId};
use convlog_protocol::crypto::DeviceCertificate;

use super::channel_gate::ChannelName;
use crate::registry::ConversationRegistry;
use crate::store::MAIN_REF;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Unknown peer {0:?}")]
    UnknownPeer(DeviceId),

    #[error("Channel declined: {0}")]
    Declined(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid channel name: {0}")]
    InvalidName(String),

    #[error("Channel closed")]
    Closed,

    #[error("Codec error: {0}")]
    Codec(String),
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn remote_device(&self) -> DeviceId;

    fn name(&self) -> &ChannelName;

    /// Remote head of `branch`, or `None` if the peer has no such branch.
    async fn fetch_head(&self, branch: &str) -> Result<Option<CommitId>, TransportError>;

    /// Envelopes needed to reach `want` from `have`, parents first. At most
    /// `limit` of them; the caller asks again with what it received.
    async fn fetch_pack(
        &self,
        want: CommitId,
        have: Vec<CommitId>,
        limit: usize,
    ) -> Result<Vec<CommitEnvelope>, TransportError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        device: &DeviceId,
        name: &ChannelName,
    ) -> Result<Arc<dyn Channel>, TransportError>;
}

/// Responder-side policy for incoming channels of one scheme.
pub trait ChannelAcceptor: Send + Sync {
    /// Whether to accept `name` from the peer holding `cert`.
    fn on_request(&self, cert: Option<&DeviceCertificate>, name: &str) -> bool;

    /// An accepted channel is open; `channel` reads from the requester.
    fn on_ready(&self, cert: &DeviceCertificate, name: &str, channel: Arc<dyn Channel>);
}

// ---------------------------------------------------------------------------
// In-process network
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct LocalPeer {
    registry: Arc<ConversationRegistry>,
    acceptors: HashMap<String, Arc<dyn ChannelAcceptor>>,
}

/// Shared broker routing channels between `LocalTransport`s.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    peers: Arc<RwLock<HashMap<DeviceId, LocalPeer>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        LocalNetwork::default()
    }

    async fn register(&self, device: DeviceId, registry: Arc<ConversationRegistry>) {
        self.peers.write().await.insert(
            device,
            LocalPeer {
                registry,
                acceptors: HashMap::new(),
            },
        );
    }

    /// Route incoming `scheme` channels for `device` to `acceptor`.
    pub async fn add_acceptor(&self, device: &DeviceId, scheme: &str, acceptor: Arc<dyn ChannelAcceptor>) {
        if let Some(peer) = self.peers.write().await.get_mut(device) {
            peer.acceptors.insert(scheme.to_string(), acceptor);
        }
    }

    /// Take `device` off the network; later connects to it fail.
    pub async fn unregister(&self, device: &DeviceId) {
        self.peers.write().await.remove(device);
    }
}

pub struct LocalTransport {
    certificate: DeviceCertificate,
    registry: Arc<ConversationRegistry>,
    network: LocalNetwork,
}

impl LocalTransport {
    /// Join `network` as the device `certificate` names, serving the
    /// conversations in `registry`.
    pub async fn new(
        network: &LocalNetwork,
        certificate: DeviceCertificate,
        registry: Arc<ConversationRegistry>,
    ) -> Self {
        network
            .register(certificate.device_id(), registry.clone())
            .await;
        LocalTransport {
            certificate,
            registry,
            network: network.clone(),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.certificate.device_id()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(
        &self,
        device: &DeviceId,
        name: &ChannelName,
    ) -> Result<Arc<dyn Channel>, TransportError> {
        let peer = self
            .network
            .peers
            .read()
            .await
            .get(device)
            .cloned()
            .ok_or(TransportError::UnknownPeer(*device))?;
        let acceptor = peer
            .acceptors
            .get(&name.scheme)
            .cloned()
            .ok_or_else(|| TransportError::Declined(format!("no handler for {}", name.scheme)))?;

        let text = name.to_string();
        if !acceptor.on_request(Some(&self.certificate), &text) {
            return Err(TransportError::Declined(text));
        }

        // The responder reads from us through the reverse channel
        let reverse: Arc<dyn Channel> = Arc::new(LocalChannel::new(
            self.certificate.device_id(),
            name.clone(),
            self.registry.clone(),
        ));
        acceptor.on_ready(&self.certificate, &text, reverse);

        let channel: Arc<dyn Channel> = Arc::new(LocalChannel::new(*device, name.clone(), peer.registry));
        Ok(channel)
    }
}

/// Reads a conversation from the registry of the device at the other end.
pub struct LocalChannel {
    remote: DeviceId,
    name: ChannelName,
    server: Arc<ConversationRegistry>,
}

impl LocalChannel {
    pub fn new(remote: DeviceId, name: ChannelName, server: Arc<ConversationRegistry>) -> Self {
        LocalChannel {
            remote,
            name,
            server,
        }
    }

    fn repository(&self) -> Result<Arc<crate::repository::Repository>, TransportError> {
        let conversation = self
            .name
            .conversation
            .ok_or_else(|| TransportError::NotFound(format!("{} names no conversation", self.name)))?;
        self.server
            .get_ready(&conversation)
            .ok_or_else(|| TransportError::NotFound(conversation.short()))
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn remote_device(&self) -> DeviceId {
        self.remote
    }

    fn name(&self) -> &ChannelName {
        &self.name
    }

    async fn fetch_head(&self, branch: &str) -> Result<Option<CommitId>, TransportError> {
        if branch != MAIN_REF {
            return Ok(None);
        }
        Ok(self.repository()?.serve_head())
    }

    async fn fetch_pack(
        &self,
        want: CommitId,
        have: Vec<CommitId>,
        limit: usize,
    ) -> Result<Vec<CommitEnvelope>, TransportError> {
        let envelopes = self
            .repository()?
            .serve_pack(&want, &have, limit)
            .map_err(|e| TransportError::NotFound(e.to_string()))?;

        envelopes
            .iter()
            .map(|envelope| {
                let bytes = envelope
                    .to_bytes()
                    .map_err(|e| TransportError::Codec(e.to_string()))?;
                CommitEnvelope::from_bytes(&bytes).map_err(|e| TransportError::Codec(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::channel_gate::ConversationChannelHandler;
    use crate::repository::tests::{create, identity};
    use crate::store::MemoryStoreFactory;
    use convlog_protocol::conversation::ConversationMode;

    #[tokio::test]
    async fn test_connect_and_fetch_head() {
        let network = LocalNetwork::new();
        let alice = identity("alice");
        let bob = identity("bob");

        let alice_registry = Arc::new(ConversationRegistry::new());
        let factory = MemoryStoreFactory::new();
        let repo = Arc::new(create(&factory, &alice, ConversationMode::Public));
        alice_registry.insert(repo.clone());
        let alice_transport =
            Arc::new(LocalTransport::new(&network, alice.certificate().clone(), alice_registry.clone()).await);
        let gate = Arc::new(ConversationChannelHandler::new(
            alice_registry.clone(),
            alice_transport.clone(),
            alice.device_id(),
            &Default::default(),
        ));
        network.add_acceptor(&alice.device_id(), "git", gate).await;

        let bob_registry = Arc::new(ConversationRegistry::new());
        let bob_transport = LocalTransport::new(&network, bob.certificate().clone(), bob_registry).await;

        let name = ChannelName::conversation("git", bob.device_id(), repo.id());
        let channel = bob_transport.connect(&alice.device_id(), &name).await.unwrap();
        assert_eq!(channel.remote_device(), alice.device_id());
        assert_eq!(channel.fetch_head(MAIN_REF).await.unwrap(), Some(repo.id()));
        assert_eq!(channel.fetch_head("other").await.unwrap(), None);

        let pack = channel.fetch_pack(repo.id(), vec![], 10).await.unwrap();
        assert_eq!(pack.len(), 1);
        assert_eq!(pack[0].id(), repo.id());

        // Alice now holds the reverse channel to Bob
        assert!(alice_registry.channel(&bob.device_id(), &repo.id()).is_some());
    }

    #[tokio::test]
    async fn test_connect_failures() {
        let network = LocalNetwork::new();
        let alice = identity("alice");
        let bob = identity("bob");
        let conversation = convlog_protocol::conversation::ConversationId::from_bytes([4; 32]);

        let registry = Arc::new(ConversationRegistry::new());
        let bob_transport = LocalTransport::new(&network, bob.certificate().clone(), registry.clone()).await;
        let name = ChannelName::conversation("git", bob.device_id(), conversation);

        assert!(matches!(
            bob_transport.connect(&alice.device_id(), &name).await,
            Err(TransportError::UnknownPeer(_))
        ));

        // Registered but no acceptor for the scheme
        LocalTransport::new(&network, alice.certificate().clone(), Arc::new(ConversationRegistry::new())).await;
        assert!(matches!(
            bob_transport.connect(&alice.device_id(), &name).await,
            Err(TransportError::Declined(_))
        ));

        network.unregister(&alice.device_id()).await;
        assert!(matches!(
            bob_transport.connect(&alice.device_id(), &name).await,
            Err(TransportError::UnknownPeer(_))
        ));
    }
}
