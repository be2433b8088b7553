//! Peer link lifecycle for one channel.
//!
//! The [`LinkManager`] turns rendezvous announcements into link events for
//! the client actor. It guarantees at most one live link per peer id: a
//! re-announce for an active peer cancels the stale link and emits its
//! disconnect before the new connect, on the same queue, so the stale
//! session is always torn down before a replacement session can start. It
//! emits exactly one [`LinkEvent::Disconnected`] per connection instance,
//! whether the link ended in a transport error, a remote close, or a
//! replacement.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::rendezvous::{PeerId, PeerLink, Subscription};

/// Link lifecycle events delivered to the client actor.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    Connected {
        channel: String,
        peer: PeerId,
        /// Connection instance, unique per manager. Disambiguates events
        /// of a stale link from those of its replacement.
        instance: u64,
        link: PeerLink,
        /// Cancelled when the link is replaced or the channel is parted.
        cancel: CancellationToken,
    },
    Disconnected {
        channel: String,
        peer: PeerId,
        instance: u64,
    },
}

/// Notification that a link's replication session has ended.
///
/// Carried on an unbounded channel: a dropped notification would leave the
/// link in `active` forever and its disconnect event never emitted.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LinkClosed {
    pub peer: PeerId,
    pub instance: u64,
}

#[derive(Debug)]
struct ActiveLink {
    instance: u64,
    cancel: CancellationToken,
}

/// Per-channel actor owning the rendezvous subscription.
#[derive(Debug)]
pub(crate) struct LinkManager {
    channel: String,
    subscription: Subscription,
    events_tx: mpsc::Sender<LinkEvent>,
    closed_rx: mpsc::UnboundedReceiver<LinkClosed>,
    cancel: CancellationToken,
    active: HashMap<PeerId, ActiveLink>,
    next_instance: u64,
}

impl LinkManager {
    pub(crate) fn new(
        channel: String,
        subscription: Subscription,
        events_tx: mpsc::Sender<LinkEvent>,
        closed_rx: mpsc::UnboundedReceiver<LinkClosed>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel,
            subscription,
            events_tx,
            closed_rx,
            cancel,
            active: HashMap::new(),
            next_instance: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut announces_open = true;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                announce = self.subscription.next_peer(), if announces_open => {
                    match announce {
                        Some(link) => self.on_announce(link).await,
                        // rendezvous gone: keep serving close notifications
                        // for links that are still up
                        None => announces_open = false,
                    }
                }
                closed = self.closed_rx.recv() => {
                    match closed {
                        Some(closed) => self.on_closed(closed).await,
                        None => break,
                    }
                }
            }
        }
        for (peer, link) in self.active.drain() {
            trace!(channel = %self.channel, peer = %peer.fmt_short(), "cancelling link");
            link.cancel.cancel();
        }
        self.subscription.close();
        debug!(channel = %self.channel, "link manager stopped");
    }

    async fn on_announce(&mut self, link: PeerLink) {
        let peer = link.peer;
        if let Some(stale) = self.active.remove(&peer) {
            debug!(
                channel = %self.channel,
                peer = %peer.fmt_short(),
                instance = stale.instance,
                "peer re-announced, replacing stale link"
            );
            stale.cancel.cancel();
            self.events_tx
                .send(LinkEvent::Disconnected {
                    channel: self.channel.clone(),
                    peer,
                    instance: stale.instance,
                })
                .await
                .ok();
        }
        self.next_instance += 1;
        let instance = self.next_instance;
        let cancel = self.cancel.child_token();
        self.active.insert(
            peer,
            ActiveLink {
                instance,
                cancel: cancel.clone(),
            },
        );
        debug!(channel = %self.channel, peer = %peer.fmt_short(), instance, "peer connected");
        self.events_tx
            .send(LinkEvent::Connected {
                channel: self.channel.clone(),
                peer,
                instance,
                link,
                cancel,
            })
            .await
            .ok();
    }

    async fn on_closed(&mut self, closed: LinkClosed) {
        match self.active.get(&closed.peer) {
            Some(active) if active.instance == closed.instance => {
                self.active.remove(&closed.peer);
                debug!(
                    channel = %self.channel,
                    peer = %closed.peer.fmt_short(),
                    instance = closed.instance,
                    "peer disconnected"
                );
                self.events_tx
                    .send(LinkEvent::Disconnected {
                        channel: self.channel.clone(),
                        peer: closed.peer,
                        instance: closed.instance,
                    })
                    .await
                    .ok();
            }
            // close of a link that was already replaced: disconnect was
            // emitted at replacement time
            _ => trace!(
                channel = %self.channel,
                peer = %closed.peer.fmt_short(),
                "ignoring close of replaced link"
            ),
        }
    }
}
