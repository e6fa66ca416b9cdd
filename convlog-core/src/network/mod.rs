/// Peer channels: the transport seam, the in-process transport, and the
/// gate that decides which incoming channels a device accepts.
pub mod channel_gate;
pub mod transport;

pub use channel_gate::{
    ChannelName, ConversationChannelHandler, SyncChannelHandler, DEFAULT_SCHEME, SYNC_SCHEME,
};
pub use transport::{
    Channel, ChannelAcceptor, LocalChannel, LocalNetwork, LocalTransport, Transport,
    TransportError,
};
