//! Peer discovery for channels.
//!
//! A channel maps to a [`TopicId`] by hashing the channel name under an
//! application namespace, so unrelated applications sharing the same
//! rendezvous infrastructure cannot cross-announce. Subscribing to a topic
//! yields [`PeerLink`]s: transport negotiation is a capability of the
//! rendezvous implementation, which hands out already-connected
//! bidirectional byte streams.
//!
//! [`MemoryRendezvous`] is the in-process implementation: every new
//! subscriber of a topic is introduced to all current subscribers over an
//! in-memory duplex stream. Networked implementations live outside this
//! crate; [`DEFAULT_ENDPOINT`] is the well-known default they use.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, Weak},
};

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

/// Namespace mixed into every topic hash.
pub const NAMESPACE: &str = "meshchat";

/// Well-known default endpoint for networked rendezvous implementations.
pub const DEFAULT_ENDPOINT: &str = "https://sdf.party";

/// Buffer size of in-memory peer links.
const DUPLEX_BUF: usize = 1 << 16;

/// Rendezvous topic for a channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicId([u8; 32]);

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", data_encoding::HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicId({})", data_encoding::HEXLOWER.encode(&self.0[..4]))
    }
}

/// Derive the topic for a channel name.
///
/// One-way and collision-resistant: distinct channel names yield distinct
/// topics with overwhelming probability, and the topic does not reveal the
/// channel name.
pub fn topic_id(channel: &str) -> TopicId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(NAMESPACE.as_bytes());
    hasher.update(b".");
    hasher.update(channel.as_bytes());
    TopicId(*hasher.finalize().as_bytes())
}

/// Identifier of a peer within one channel's current peer set.
///
/// Assigned per subscription; there is no identity across reconnects. A
/// peer that drops and rejoins shows up with a new id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 16]);

impl PeerId {
    pub(crate) fn random() -> Self {
        Self(rand::random())
    }

    /// Shortened hex form for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", data_encoding::HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.fmt_short())
    }
}

/// Bidirectional byte stream to one peer.
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> LinkStream for T {}

/// A connected peer: an opaque bidirectional stream plus its id.
pub struct PeerLink {
    /// Peer id, unique within the channel's current peer set.
    pub peer: PeerId,
    /// The negotiated byte stream.
    pub stream: Box<dyn LinkStream>,
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Source of peer announcements for one channel.
pub trait Rendezvous: Send + Sync + fmt::Debug + 'static {
    /// Start announcing and listening on `topic`.
    fn subscribe(&self, topic: TopicId) -> Result<Subscription>;
}

/// An active rendezvous subscription.
///
/// Yields one [`PeerLink`] per announced peer. Closing stops announcing
/// and listening; close is idempotent and also happens on drop. Links
/// already handed out stay alive independently of the subscription.
pub struct Subscription {
    topic: TopicId,
    local_peer: PeerId,
    announces: async_channel::Receiver<PeerLink>,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("local_peer", &self.local_peer)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Assemble a subscription. Used by [`Rendezvous`] implementations.
    pub fn new(
        topic: TopicId,
        local_peer: PeerId,
        announces: async_channel::Receiver<PeerLink>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            topic,
            local_peer,
            announces,
            on_close: Mutex::new(Some(Box::new(on_close))),
        }
    }

    pub fn topic(&self) -> TopicId {
        self.topic
    }

    /// Our own ephemeral id within this topic.
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Next announced peer, or `None` once the subscription is closed.
    pub async fn next_peer(&self) -> Option<PeerLink> {
        self.announces.recv().await.ok()
    }

    /// Stop announcing and listening. Idempotent.
    pub fn close(&self) {
        if let Some(unregister) = self.on_close.lock().expect("poisoned").take() {
            trace!(topic = %self.topic, "closing rendezvous subscription");
            unregister();
        }
        self.announces.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// In-process rendezvous bus.
///
/// Clones share the same bus; every client that should be able to meet
/// must hold a clone of the same instance. Each new subscriber of a topic
/// is introduced to every current subscriber with a fresh duplex stream
/// pair, one end announced to each side.
#[derive(Debug, Clone, Default)]
pub struct MemoryRendezvous {
    bus: Arc<Mutex<HashMap<TopicId, Vec<Registration>>>>,
}

#[derive(Debug)]
struct Registration {
    peer: PeerId,
    announce_tx: async_channel::Sender<PeerLink>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions for `topic`.
    pub fn subscriber_count(&self, topic: &TopicId) -> usize {
        self.bus
            .lock()
            .expect("poisoned")
            .get(topic)
            .map(|regs| regs.len())
            .unwrap_or(0)
    }
}

impl Rendezvous for MemoryRendezvous {
    fn subscribe(&self, topic: TopicId) -> Result<Subscription> {
        let local_peer = PeerId::random();
        let (announce_tx, announce_rx) = async_channel::unbounded();

        let mut bus = self.bus.lock().expect("poisoned");
        let regs = bus.entry(topic).or_default();
        regs.retain(|reg| !reg.announce_tx.is_closed());
        for reg in regs.iter() {
            let (ours, theirs) = tokio::io::duplex(DUPLEX_BUF);
            // introduce both sides; a side that is gone just misses out
            reg.announce_tx
                .try_send(PeerLink {
                    peer: local_peer,
                    stream: Box::new(theirs),
                })
                .ok();
            announce_tx
                .try_send(PeerLink {
                    peer: reg.peer,
                    stream: Box::new(ours),
                })
                .ok();
        }
        regs.push(Registration {
            peer: local_peer,
            announce_tx,
        });
        trace!(%topic, peer = %local_peer.fmt_short(), subscribers = regs.len(), "subscribed");
        drop(bus);

        let bus = Arc::downgrade(&self.bus);
        Ok(Subscription::new(
            topic,
            local_peer,
            announce_rx,
            move || unregister(bus, topic, local_peer),
        ))
    }
}

fn unregister(
    bus: Weak<Mutex<HashMap<TopicId, Vec<Registration>>>>,
    topic: TopicId,
    peer: PeerId,
) {
    let Some(bus) = bus.upgrade() else {
        return;
    };
    let mut bus = bus.lock().expect("poisoned");
    if let Some(regs) = bus.get_mut(&topic) {
        regs.retain(|reg| reg.peer != peer);
        if regs.is_empty() {
            bus.remove(&topic);
        }
    }
}
