/// Channel acceptance gate.
///
/// Incoming channel names have the form `<scheme>://<device>/<conversation>`
/// where `<device>` is the requesting device. A conversation channel is
/// accepted only for a conversation this device already holds (so a peer
/// never starts syncing against a replica that is not ready), and never for
/// a banned device or a device of a banned member. `sync://<device>`
/// channels link devices of the same account.
///
/// `on_request` reads only local state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use convlog_protocol::conversation::{ConversationId, DeviceId};
use convlog_protocol::crypto::DeviceCertificate;

use super::transport::{Channel, ChannelAcceptor, Transport, TransportError};
use crate::config::ConvlogConfig;
use crate::registry::ConversationRegistry;

pub const DEFAULT_SCHEME: &str = "git";
pub const SYNC_SCHEME: &str = "sync";

// ---------------------------------------------------------------------------
// Channel names
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName {
    pub scheme: String,
    /// Requesting device.
    pub device: DeviceId,
    pub conversation: Option<ConversationId>,
}

impl ChannelName {
    pub fn conversation(scheme: &str, device: DeviceId, conversation: ConversationId) -> Self {
        ChannelName {
            scheme: scheme.to_string(),
            device,
            conversation: Some(conversation),
        }
    }

    pub fn sync(device: DeviceId) -> Self {
        ChannelName {
            scheme: SYNC_SCHEME.to_string(),
            device,
            conversation: None,
        }
    }

    pub fn parse(name: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidName(name.to_string());
        let (scheme, rest) = name.split_once("://").ok_or_else(invalid)?;
        if scheme.is_empty() {
            return Err(invalid());
        }
        let (device, conversation) = match rest.split_once('/') {
            Some((device, conversation)) => {
                let conversation = ConversationId::from_hex(conversation).map_err(|_| invalid())?;
                (device, Some(conversation))
            }
            None => (rest, None),
        };
        Ok(ChannelName {
            scheme: scheme.to_string(),
            device: DeviceId::from_hex(device).map_err(|_| invalid())?,
            conversation,
        })
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.device)?;
        if let Some(conversation) = &self.conversation {
            write!(f, "/{}", conversation)?;
        }
        Ok(())
    }
}

/// Run `connect` bounded by `timeout`; `None` on any failure.
async fn connect_bounded(
    transport: &dyn Transport,
    device: &DeviceId,
    name: &ChannelName,
    timeout: Duration,
) -> Option<Arc<dyn Channel>> {
    match tokio::time::timeout(timeout, transport.connect(device, name)).await {
        Ok(Ok(channel)) => Some(channel),
        Ok(Err(e)) => {
            log::warn!("Channel {} to {} failed: {}", name, device.short(), e);
            None
        }
        Err(_) => {
            log::warn!("Channel {} to {} timed out", name, device.short());
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation channels
// ---------------------------------------------------------------------------

pub struct ConversationChannelHandler {
    registry: Arc<ConversationRegistry>,
    transport: Arc<dyn Transport>,
    local_device: DeviceId,
    scheme: String,
    connect_timeout: Duration,
}

impl ConversationChannelHandler {
    pub fn new(
        registry: Arc<ConversationRegistry>,
        transport: Arc<dyn Transport>,
        local_device: DeviceId,
        config: &ConvlogConfig,
    ) -> Self {
        ConversationChannelHandler {
            registry,
            transport,
            local_device,
            scheme: config.channel_scheme.clone(),
            connect_timeout: config.connect_timeout(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Open a channel for `conversation` to `device`. `cb` gets the channel,
    /// or `None` if the peer declined, failed or did not answer in time.
    pub async fn connect<F>(&self, device: &DeviceId, conversation: &ConversationId, cb: F)
    where
        F: FnOnce(Option<Arc<dyn Channel>>) + Send,
    {
        let name = ChannelName::conversation(&self.scheme, self.local_device, *conversation);
        let channel =
            connect_bounded(self.transport.as_ref(), device, &name, self.connect_timeout).await;
        if let Some(channel) = &channel {
            self.registry.add_channel(*device, *conversation, channel.clone());
        }
        cb(channel)
    }
}

impl ChannelAcceptor for ConversationChannelHandler {
    fn on_request(&self, cert: Option<&DeviceCertificate>, name: &str) -> bool {
        let parsed = match ChannelName::parse(name) {
            Ok(parsed) if parsed.scheme == self.scheme => parsed,
            _ => {
                log::debug!("Declined channel {:?}: bad name", name);
                return false;
            }
        };
        let conversation = match parsed.conversation {
            Some(conversation) => conversation,
            None => return false,
        };
        let cert = match cert {
            Some(cert) => cert,
            None => {
                log::debug!("Declined channel {}: no certificate", name);
                return false;
            }
        };
        if cert.verify().is_err() || cert.device_id() != parsed.device {
            log::warn!("Declined channel {}: certificate does not match", name);
            return false;
        }

        // Not ready yet: the peer would try to sync against nothing
        let repo = match self.registry.get_ready(&conversation) {
            Some(repo) => repo,
            None => {
                log::debug!("Declined channel {}: conversation not ready", name);
                return false;
            }
        };
        if repo.is_banned_device(&parsed.device) {
            log::info!("Declined channel {}: banned device", name);
            return false;
        }
        if repo.is_banned_member(&cert.uri()) {
            log::info!("Declined channel {}: banned member", name);
            return false;
        }
        true
    }

    fn on_ready(&self, cert: &DeviceCertificate, name: &str, channel: Arc<dyn Channel>) {
        match ChannelName::parse(name).ok().and_then(|parsed| parsed.conversation) {
            Some(conversation) => {
                self.registry
                    .add_channel(cert.device_id(), conversation, channel);
                log::info!(
                    "Channel from {} ready for {}",
                    cert.device_id().short(),
                    conversation.short()
                );
            }
            None => log::warn!("Ready channel {:?} names no conversation", name),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync channels
// ---------------------------------------------------------------------------

/// Channels between devices of the local account.
pub struct SyncChannelHandler {
    registry: Arc<ConversationRegistry>,
    transport: Arc<dyn Transport>,
    local_uri: String,
    local_device: DeviceId,
    connect_timeout: Duration,
}

impl SyncChannelHandler {
    pub fn new(
        registry: Arc<ConversationRegistry>,
        transport: Arc<dyn Transport>,
        local_uri: &str,
        local_device: DeviceId,
        config: &ConvlogConfig,
    ) -> Self {
        SyncChannelHandler {
            registry,
            transport,
            local_uri: local_uri.to_string(),
            local_device,
            connect_timeout: config.connect_timeout(),
        }
    }

    /// Reuses an open sync channel to `device` when there is one.
    pub async fn connect<F>(&self, device: &DeviceId, cb: F)
    where
        F: FnOnce(Option<Arc<dyn Channel>>) + Send,
    {
        if let Some(channel) = self.registry.sync_channel(device) {
            log::debug!("Already connected to {}", device.short());
            return cb(Some(channel));
        }
        let name = ChannelName::sync(self.local_device);
        let channel =
            connect_bounded(self.transport.as_ref(), device, &name, self.connect_timeout).await;
        if let Some(channel) = &channel {
            self.registry.add_sync_channel(*device, channel.clone());
        }
        cb(channel)
    }
}

impl ChannelAcceptor for SyncChannelHandler {
    fn on_request(&self, cert: Option<&DeviceCertificate>, name: &str) -> bool {
        let cert = match cert {
            Some(cert) if cert.verify().is_ok() => cert,
            _ => return false,
        };
        let device_matches = ChannelName::parse(name)
            .map(|parsed| parsed.scheme == SYNC_SCHEME && parsed.device == cert.device_id())
            .unwrap_or(false);
        device_matches && cert.uri() == self.local_uri && cert.device_id() != self.local_device
    }

    fn on_ready(&self, cert: &DeviceCertificate, _name: &str, channel: Arc<dyn Channel>) {
        self.registry.add_sync_channel(cert.device_id(), channel);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
