/// Process-wide bookkeeping of open conversations and peer channels.
///
/// The channel gate answers from here without touching the network, and
/// the local transport serves peers' fetches from the repositories
/// registered here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use convlog_protocol::conversation::{ConversationId, DeviceId};

use crate::network::Channel;
use crate::repository::Repository;

type ChannelMap = HashMap<DeviceId, HashMap<ConversationId, Arc<dyn Channel>>>;

#[derive(Default)]
pub struct ConversationRegistry {
    repos: RwLock<HashMap<ConversationId, Arc<Repository>>>,
    channels: Mutex<ChannelMap>,
    sync_channels: Mutex<HashMap<DeviceId, Arc<dyn Channel>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConversationRegistry {
    pub fn new() -> Self {
        ConversationRegistry::default()
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    pub fn insert(&self, repo: Arc<Repository>) {
        let id = repo.id();
        self.repos
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, repo);
        log::debug!("Registered conversation {}", id.short());
    }

    /// Forget a conversation and every channel opened for it.
    pub fn remove(&self, id: &ConversationId) -> Option<Arc<Repository>> {
        for per_device in lock(&self.channels).values_mut() {
            per_device.remove(id);
        }
        self.repos
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn get(&self, id: &ConversationId) -> Option<Arc<Repository>> {
        self.repos
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Registered and holding a head.
    pub fn get_ready(&self, id: &ConversationId) -> Option<Arc<Repository>> {
        self.get(id).filter(|repo| repo.head().is_some())
    }

    pub fn is_ready(&self, id: &ConversationId) -> bool {
        self.get_ready(id).is_some()
    }

    pub fn ids(&self) -> Vec<ConversationId> {
        let mut ids: Vec<ConversationId> = self
            .repos
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    pub fn add_channel(&self, device: DeviceId, conversation: ConversationId, channel: Arc<dyn Channel>) {
        lock(&self.channels)
            .entry(device)
            .or_default()
            .insert(conversation, channel);
        log::debug!(
            "Channel to {} for {} registered",
            device.short(),
            conversation.short()
        );
    }

    pub fn channel(&self, device: &DeviceId, conversation: &ConversationId) -> Option<Arc<dyn Channel>> {
        lock(&self.channels)
            .get(device)
            .and_then(|per_device| per_device.get(conversation))
            .cloned()
    }

    pub fn remove_channel(&self, device: &DeviceId, conversation: &ConversationId) -> Option<Arc<dyn Channel>> {
        let mut channels = lock(&self.channels);
        let per_device = channels.get_mut(device)?;
        let removed = per_device.remove(conversation);
        if per_device.is_empty() {
            channels.remove(device);
        }
        removed
    }

    /// Open channels of a conversation, by peer device.
    pub fn channels_for(&self, conversation: &ConversationId) -> Vec<(DeviceId, Arc<dyn Channel>)> {
        let mut found: Vec<(DeviceId, Arc<dyn Channel>)> = lock(&self.channels)
            .iter()
            .filter_map(|(device, per_device)| {
                per_device
                    .get(conversation)
                    .map(|channel| (*device, channel.clone()))
            })
            .collect();
        found.sort_by_key(|(device, _)| *device);
        found
    }

    pub fn add_sync_channel(&self, device: DeviceId, channel: Arc<dyn Channel>) {
        lock(&self.sync_channels).insert(device, channel);
        log::debug!("Sync channel to {} registered", device.short());
    }

    pub fn sync_channel(&self, device: &DeviceId) -> Option<Arc<dyn Channel>> {
        lock(&self.sync_channels).get(device).cloned()
    }

    /// Drop every channel to `device`.
    pub fn disconnect(&self, device: &DeviceId) {
        lock(&self.channels).remove(device);
        lock(&self.sync_channels).remove(device);
        log::info!("Dropped channels to {}", device.short());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ChannelName, LocalChannel};
    use crate::repository::tests::{create, identity};
    use crate::store::MemoryStoreFactory;
    use convlog_protocol::conversation::ConversationMode;

    #[test]
    fn test_conversations() {
        let registry = ConversationRegistry::new();
        let factory = MemoryStoreFactory::new();
        let alice = identity("alice");
        let repo = Arc::new(create(&factory, &alice, ConversationMode::Public));
        let id = repo.id();

        assert!(!registry.is_ready(&id));
        registry.insert(repo.clone());
        assert!(registry.is_ready(&id));
        assert_eq!(registry.ids(), vec![id]);

        repo.erase().unwrap();
        assert!(registry.get(&id).is_some());
        assert!(!registry.is_ready(&id));

        assert!(registry.remove(&id).is_some());
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn test_channels() {
        let registry = Arc::new(ConversationRegistry::new());
        let device = DeviceId::from_bytes([1; 16]);
        let conversation = ConversationId::from_bytes([2; 32]);
        let name = ChannelName::conversation("git", device, conversation);
        let channel: Arc<dyn Channel> = Arc::new(LocalChannel::new(device, name, registry.clone()));

        registry.add_channel(device, conversation, channel.clone());
        assert!(registry.channel(&device, &conversation).is_some());
        assert_eq!(registry.channels_for(&conversation).len(), 1);

        registry.add_sync_channel(device, channel);
        assert!(registry.sync_channel(&device).is_some());

        registry.disconnect(&device);
        assert!(registry.channel(&device, &conversation).is_none());
        assert!(registry.sync_channel(&device).is_none());
        assert!(registry.remove_channel(&device, &conversation).is_none());
    }
}
