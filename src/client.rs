//! The chat client: channel controller and event fan-out.
//!
//! A [`Client`] is a cheap handle to an actor task that owns all channel
//! state. Joining a channel opens its log, subscribes to rendezvous, and
//! wires peer links into replication sessions; the actor emits [`Event`]s
//! for the presentation layer and tears everything down on part.

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, trace, warn, Instrument};

use crate::{
    log::{now_ms, ChannelLog, LogEntry, Payload},
    net::{LinkClosed, LinkEvent, LinkManager},
    rendezvous::{topic_id, MemoryRendezvous, PeerId, Rendezvous},
    session::{self, SessionError},
    store::{KvStore, MemStore},
};

/// The local-only status channel. Never joined to the network, never
/// replicated; carries system and error messages.
pub const STATUS_CHANNEL: &str = "!status";

/// Author of system messages on the status channel.
pub const STATUS_USER: &str = "!info";

/// Channel capacity for the actor inbox.
const TO_ACTOR_CAP: usize = 64;
/// Channel capacity for link events (all channels share one queue).
const LINK_EVENTS_CAP: usize = 64;
/// Channel capacity for log change forwarding.
const CHANGES_CAP: usize = 256;

/// Events emitted by the client, consumed by the presentation layer.
#[derive(Debug, Clone, PartialEq, strum::Display)]
pub enum Event {
    /// A channel was joined (re-emitted on idempotent joins).
    Join { channel: String },
    /// A channel was parted.
    Part { channel: String },
    /// A peer connected for a channel.
    Peer { channel: String, peer: PeerId },
    /// A peer disconnected from a channel.
    Disconnect { channel: String, peer: PeerId },
    /// An entry arrived on a channel's log (local send or replication).
    Change { channel: String, entry: LogEntry },
}

/// Messages to the client actor.
#[derive(Debug, strum::Display)]
enum ToActor {
    Join {
        channel: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Part {
        channel: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        channel: String,
        payload: Payload,
        reply: oneshot::Sender<Result<()>>,
    },
    SetUser {
        name: String,
        reply: oneshot::Sender<()>,
    },
    PostStatus {
        text: String,
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        reply: oneshot::Sender<async_channel::Receiver<Event>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running chat client.
///
/// Clones share the same actor. The actor is aborted when the last handle
/// is dropped; use [`Self::shutdown`] for a graceful stop.
#[derive(Debug, Clone)]
pub struct Client {
    to_actor_tx: mpsc::Sender<ToActor>,
    _actor_handle: Arc<AbortOnDrop>,
}

impl Client {
    /// Start building a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Join a channel. Idempotent on state; every call emits
    /// [`Event::Join`]. Joining [`STATUS_CHANNEL`] only emits the event.
    pub async fn join(&self, channel: &str) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_msg(ToActor::Join {
            channel: channel.to_string(),
            reply,
        })
        .await?;
        reply_rx.await.map_err(|_| anyhow!("client actor dropped"))?
    }

    /// Part a channel, tearing down its sessions, links, and rendezvous
    /// subscription. A no-op without an event when not joined. Stored log
    /// data is kept.
    pub async fn part(&self, channel: &str) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_msg(ToActor::Part {
            channel: channel.to_string(),
            reply,
        })
        .await?;
        reply_rx.await.map_err(|_| anyhow!("client actor dropped"))?
    }

    /// Append a message to a channel's log. Fire-and-forget at the log
    /// layer: replication picks it up from the live read stream. A no-op
    /// when the channel is not joined or is the status channel.
    pub async fn send(&self, channel: &str, payload: impl Into<Payload>) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_msg(ToActor::Send {
            channel: channel.to_string(),
            payload: payload.into(),
            reply,
        })
        .await?;
        reply_rx.await.map_err(|_| anyhow!("client actor dropped"))?
    }

    /// Change the local user identifier. Affects only future entries.
    pub async fn set_user(&self, name: impl Into<String>) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_msg(ToActor::SetUser {
            name: name.into(),
            reply,
        })
        .await?;
        reply_rx.await.map_err(|_| anyhow!("client actor dropped"))
    }

    /// Emit a system message on the status channel, authored as
    /// [`STATUS_USER`]. Local only, never stored or replicated.
    pub async fn post_status(&self, text: impl Into<String>) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_msg(ToActor::PostStatus {
            text: text.into(),
            reply,
        })
        .await?;
        reply_rx.await.map_err(|_| anyhow!("client actor dropped"))
    }

    /// Subscribe to client events. Every subscriber sees every event from
    /// the moment of subscription.
    pub async fn subscribe(&self) -> Result<async_channel::Receiver<Event>> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_msg(ToActor::Subscribe { reply }).await?;
        reply_rx.await.map_err(|_| anyhow!("client actor dropped"))
    }

    /// Gracefully stop the actor, parting all channels.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_msg(ToActor::Shutdown { reply }).await?;
        reply_rx.await.ok();
        Ok(())
    }

    async fn send_msg(&self, msg: ToActor) -> Result<()> {
        self.to_actor_tx
            .send(msg)
            .await
            .map_err(|_| anyhow!("client actor dropped"))
    }
}

#[derive(Debug)]
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Configuration for a [`Client`].
///
/// Defaults: a random hex nickname, an in-memory store, and a fresh
/// (isolated) in-memory rendezvous. Clients that should meet must share a
/// rendezvous handle.
#[derive(Debug, Default)]
pub struct ClientBuilder {
    user: Option<String>,
    store: Option<Arc<dyn KvStore>>,
    rendezvous: Option<Arc<dyn Rendezvous>>,
}

impl ClientBuilder {
    /// Initial user identifier.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Backing store for channel logs.
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Rendezvous service for peer discovery.
    pub fn rendezvous(mut self, rendezvous: Arc<dyn Rendezvous>) -> Self {
        self.rendezvous = Some(rendezvous);
        self
    }

    /// Spawn the client actor. Must be called within a tokio runtime.
    pub fn spawn(self) -> Client {
        let user = self.user.unwrap_or_else(default_nick);
        let store = self.store.unwrap_or_else(|| Arc::new(MemStore::new()));
        let rendezvous = self
            .rendezvous
            .unwrap_or_else(|| Arc::new(MemoryRendezvous::new()));

        let (to_actor_tx, to_actor_rx) = mpsc::channel(TO_ACTOR_CAP);
        let (link_events_tx, link_events_rx) = mpsc::channel(LINK_EVENTS_CAP);
        let (changes_tx, changes_rx) = mpsc::channel(CHANGES_CAP);

        let me = user.clone();
        let actor = Actor {
            user,
            store,
            rendezvous,
            inbox: to_actor_rx,
            channels: HashMap::new(),
            logs: HashMap::new(),
            link_events_tx,
            link_events_rx,
            changes_tx,
            changes_rx,
            sessions: JoinSet::new(),
            subscribers: EventSenders::default(),
        };
        let handle = tokio::spawn(
            async move {
                actor.run().await;
            }
            .instrument(error_span!("client", %me)),
        );
        Client {
            to_actor_tx,
            _actor_handle: Arc::new(AbortOnDrop(handle)),
        }
    }
}

/// Random default nickname, three bytes of entropy in hex.
fn default_nick() -> String {
    data_encoding::HEXLOWER.encode(&rand::random::<[u8; 3]>())
}

type SessionOutcome = (String, PeerId, u64, Result<(), SessionError>);

/// All state for one joined channel, deleted wholesale on part.
#[derive(Debug)]
struct ChannelState {
    log: Arc<ChannelLog>,
    /// Connected peers, by live connection instance.
    peers: HashMap<PeerId, u64>,
    /// Active replication sessions; always a subset of `peers`.
    sessions: HashMap<PeerId, SessionHandle>,
    /// Close notifications back to this channel's link manager. Unbounded:
    /// losing one would leak the peer and swallow its disconnect event.
    closed_tx: mpsc::UnboundedSender<LinkClosed>,
    /// Parent token for every task of this channel.
    cancel: CancellationToken,
}

#[derive(Debug)]
struct SessionHandle {
    instance: u64,
    cancel: CancellationToken,
}

struct Actor {
    user: String,
    store: Arc<dyn KvStore>,
    rendezvous: Arc<dyn Rendezvous>,
    inbox: mpsc::Receiver<ToActor>,
    /// State per joined channel, keyed by channel name.
    channels: HashMap<String, ChannelState>,
    /// Log handles, cached for the controller lifetime: a channel's log
    /// store is attached at most once, and rejoining after part reuses it.
    logs: HashMap<String, Arc<ChannelLog>>,
    /// Cloned into link managers.
    link_events_tx: mpsc::Sender<LinkEvent>,
    link_events_rx: mpsc::Receiver<LinkEvent>,
    /// Cloned into live-read forwarder tasks.
    changes_tx: mpsc::Sender<(String, LogEntry)>,
    changes_rx: mpsc::Receiver<(String, LogEntry)>,
    /// Running replication sessions for all channels.
    sessions: JoinSet<SessionOutcome>,
    subscribers: EventSenders,
}

impl Actor {
    async fn run(mut self) {
        let reply = loop {
            tokio::select! {
                biased;
                msg = self.inbox.recv() => {
                    match msg {
                        None => break None,
                        Some(ToActor::Shutdown { reply }) => break Some(reply),
                        Some(msg) => self.on_actor_message(msg).await,
                    }
                }
                event = self.link_events_rx.recv() => {
                    // we hold a sender clone, so this never closes
                    match event {
                        Some(event) => self.on_link_event(event),
                        None => unreachable!("link event channel closed"),
                    }
                }
                change = self.changes_rx.recv() => {
                    match change {
                        Some((channel, entry)) => self.on_change(channel, entry),
                        None => unreachable!("change channel closed"),
                    }
                }
                Some(res) = self.sessions.join_next(), if !self.sessions.is_empty() => {
                    self.on_session_finished(res);
                }
            }
        };
        // teardown: cancel every channel without emitting events
        for (channel, state) in self.channels.drain() {
            trace!(%channel, "cancelling channel on shutdown");
            state.cancel.cancel();
        }
        self.sessions.shutdown().await;
        if let Some(reply) = reply {
            reply.send(()).ok();
        }
        debug!("client actor stopped");
    }

    async fn on_actor_message(&mut self, msg: ToActor) {
        trace!(%msg, "handle message");
        match msg {
            ToActor::Join { channel, reply } => {
                let res = self.handle_join(&channel);
                reply.send(res).ok();
            }
            ToActor::Part { channel, reply } => {
                self.handle_part(&channel);
                reply.send(Ok(())).ok();
            }
            ToActor::Send {
                channel,
                payload,
                reply,
            } => {
                let res = self.handle_send(&channel, payload);
                reply.send(res).ok();
            }
            ToActor::SetUser { name, reply } => {
                debug!(user = %name, "set user");
                self.user = name;
                reply.send(()).ok();
            }
            ToActor::PostStatus { text, reply } => {
                self.post_status(text);
                reply.send(()).ok();
            }
            ToActor::Subscribe { reply } => {
                reply.send(self.subscribers.subscribe()).ok();
            }
            ToActor::Shutdown { .. } => unreachable!("handled in run"),
        }
    }

    fn handle_join(&mut self, channel: &str) -> Result<()> {
        debug!(%channel, "join");
        if channel == STATUS_CHANNEL || self.channels.contains_key(channel) {
            // idempotent on state, but every call re-emits the event
            self.emit(Event::Join {
                channel: channel.to_string(),
            });
            return Ok(());
        }

        let log = match self.logs.get(channel) {
            Some(log) => log.clone(),
            None => match ChannelLog::open(self.store.clone(), channel) {
                Ok(log) => {
                    let log = Arc::new(log);
                    self.logs.insert(channel.to_string(), log.clone());
                    log
                }
                Err(err) => {
                    warn!(%channel, "join failed: {err}");
                    self.post_status(format!("join {channel} failed: {err}"));
                    return Err(err.into());
                }
            },
        };

        let cancel = CancellationToken::new();

        // forward the full log plus its live tail as change events
        let (snapshot, live) = log.subscribe();
        let changes_tx = self.changes_tx.clone();
        let forward_channel = channel.to_string();
        let forward_cancel = cancel.clone();
        tokio::spawn(
            async move {
                for entry in snapshot {
                    if changes_tx.send((forward_channel.clone(), entry)).await.is_err() {
                        return;
                    }
                }
                loop {
                    tokio::select! {
                        biased;
                        _ = forward_cancel.cancelled() => break,
                        entry = live.recv() => match entry {
                            Ok(entry) => {
                                if changes_tx.send((forward_channel.clone(), entry)).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            .instrument(error_span!("live-read", channel = %channel)),
        );

        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        match self.rendezvous.subscribe(topic_id(channel)) {
            Ok(subscription) => {
                let manager = LinkManager::new(
                    channel.to_string(),
                    subscription,
                    self.link_events_tx.clone(),
                    closed_rx,
                    cancel.clone(),
                );
                tokio::spawn(
                    manager
                        .run()
                        .instrument(error_span!("links", channel = %channel)),
                );
            }
            // the channel stays joined: the user can post locally and
            // replication simply has zero peers
            Err(err) => warn!(%channel, "rendezvous subscription failed: {err:#}"),
        }

        self.channels.insert(
            channel.to_string(),
            ChannelState {
                log,
                peers: HashMap::new(),
                sessions: HashMap::new(),
                closed_tx,
                cancel,
            },
        );
        self.emit(Event::Join {
            channel: channel.to_string(),
        });
        Ok(())
    }

    fn handle_part(&mut self, channel: &str) {
        let Some(state) = self.channels.remove(channel) else {
            // not joined: silent no-op
            return;
        };
        debug!(%channel, peers = state.peers.len(), "part");
        // cancels the link manager (which closes the rendezvous
        // subscription), the live-read forwarder, and every session
        state.cancel.cancel();
        self.emit(Event::Part {
            channel: channel.to_string(),
        });
    }

    fn handle_send(&mut self, channel: &str, payload: Payload) -> Result<()> {
        if channel == STATUS_CHANNEL {
            return Ok(());
        }
        let Some(state) = self.channels.get(channel) else {
            trace!(%channel, "send to unjoined channel ignored");
            return Ok(());
        };
        let entry = LogEntry::new(now_ms(), self.user.clone(), payload);
        match state.log.append(entry) {
            Ok((id, _)) => {
                trace!(%channel, id = %id.fmt_short(), "sent");
                Ok(())
            }
            Err(err) => {
                warn!(%channel, "send failed: {err}");
                self.post_status(format!("send to {channel} failed: {err}"));
                Err(err.into())
            }
        }
    }

    fn post_status(&mut self, text: String) {
        self.emit(Event::Change {
            channel: STATUS_CHANNEL.to_string(),
            entry: LogEntry::new(now_ms(), STATUS_USER, text),
        });
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected {
                channel,
                peer,
                instance,
                link,
                cancel,
            } => {
                let Some(state) = self.channels.get_mut(&channel) else {
                    // connect raced with part; the link is dropped here
                    return;
                };
                state.peers.insert(peer, instance);
                state.sessions.insert(
                    peer,
                    SessionHandle {
                        instance,
                        cancel: cancel.clone(),
                    },
                );
                let log = state.log.clone();
                let session_channel = channel.clone();
                let span =
                    error_span!("session", channel = %channel, peer = %peer.fmt_short());
                self.sessions.spawn(
                    async move {
                        let res = session::run(log, link, cancel).await;
                        (session_channel, peer, instance, res)
                    }
                    .instrument(span),
                );
                self.emit(Event::Peer { channel, peer });
            }
            LinkEvent::Disconnected {
                channel,
                peer,
                instance,
            } => {
                let Some(state) = self.channels.get_mut(&channel) else {
                    return;
                };
                if state.peers.get(&peer) == Some(&instance) {
                    state.peers.remove(&peer);
                }
                if state
                    .sessions
                    .get(&peer)
                    .is_some_and(|s| s.instance == instance)
                {
                    state.sessions.remove(&peer);
                }
                self.emit(Event::Disconnect { channel, peer });
            }
        }
    }

    fn on_session_finished(&mut self, res: Result<SessionOutcome, tokio::task::JoinError>) {
        let (channel, peer, instance, res) = match res {
            Ok(outcome) => outcome,
            Err(err) => {
                if !err.is_cancelled() {
                    warn!("session task panicked: {err:?}");
                }
                return;
            }
        };
        match res {
            Ok(()) => debug!(%channel, peer = %peer.fmt_short(), "session closed"),
            // faults are contained: log and tear down this session only
            Err(err) => warn!(%channel, peer = %peer.fmt_short(), "session failed: {err}"),
        }
        let Some(state) = self.channels.get_mut(&channel) else {
            // landed after part: channel state is gone, nothing to do
            return;
        };
        if state
            .sessions
            .get(&peer)
            .is_some_and(|s| s.instance == instance)
        {
            let session = state.sessions.remove(&peer).expect("checked above");
            session.cancel.cancel();
            // the link manager emits the disconnect event, exactly once
            state.closed_tx.send(LinkClosed { peer, instance }).ok();
        }
    }

    fn on_change(&mut self, channel: String, entry: LogEntry) {
        // in-flight changes for a parted channel are dropped
        if self.channels.contains_key(&channel) {
            self.emit(Event::Change { channel, entry });
        }
    }

    fn emit(&mut self, event: Event) {
        trace!(%event, "emit");
        self.subscribers.send(&event);
    }
}

/// Fan-out of client events to any number of subscribers.
#[derive(Debug, Default)]
struct EventSenders {
    senders: Vec<async_channel::Sender<Event>>,
}

impl EventSenders {
    fn subscribe(&mut self) -> async_channel::Receiver<Event> {
        let (tx, rx) = async_channel::unbounded();
        self.senders.push(tx);
        rx
    }

    fn send(&mut self, event: &Event) {
        self.senders.retain(|tx| tx.try_send(event.clone()).is_ok());
    }
}

/// Best-effort chronological view of a channel, for display.
///
/// Keeps entries sorted by their author timestamp. The sort is stable, so
/// entries with equal timestamps keep arrival order, and clock skew is
/// tolerated without correction. This is display-layer reconciliation,
/// not a replication guarantee; timestamps are author-claimed and
/// unauthenticated.
#[derive(Debug, Default)]
pub struct ChannelView {
    entries: Vec<LogEntry>,
}

impl ChannelView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, keeping the view sorted by time.
    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
        self.entries.sort_by_key(|e| e.time);
    }

    /// Entries in best-effort chronological order.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_reconciles_out_of_order_timestamps() {
        let mut view = ChannelView::new();
        view.push(LogEntry::new(100, "a", "second"));
        view.push(LogEntry::new(50, "b", "first"));
        let order: Vec<_> = view.entries().iter().map(|e| e.time).collect();
        assert_eq!(order, vec![50, 100]);
        assert_eq!(view.entries()[0].data, Payload::Text("first".into()));
    }

    #[test]
    fn view_sort_is_stable_on_ties() {
        let mut view = ChannelView::new();
        view.push(LogEntry::new(10, "a", "first arrival"));
        view.push(LogEntry::new(10, "b", "second arrival"));
        view.push(LogEntry::new(5, "c", "earlier"));
        let users: Vec<_> = view.entries().iter().map(|e| e.user.as_str()).collect();
        assert_eq!(users, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn status_send_is_a_noop() {
        let client = Client::builder().user("tester").spawn();
        let events = client.subscribe().await.unwrap();
        client.join(STATUS_CHANNEL).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            Event::Join {
                channel: STATUS_CHANNEL.to_string()
            }
        );
        client.send(STATUS_CHANNEL, "ignored").await.unwrap();
        client.post_status("visible").await.unwrap();
        // only the explicit status post produces a change
        match events.recv().await.unwrap() {
            Event::Change { channel, entry } => {
                assert_eq!(channel, STATUS_CHANNEL);
                assert_eq!(entry.user, STATUS_USER);
                assert_eq!(entry.data, Payload::Text("visible".into()));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn set_user_affects_only_future_entries() {
        let client = Client::builder().user("before").spawn();
        let events = client.subscribe().await.unwrap();
        client.join("general").await.unwrap();
        client.send("general", "one").await.unwrap();
        client.set_user("after").await.unwrap();
        client.send("general", "two").await.unwrap();

        let mut users = Vec::new();
        while users.len() < 2 {
            if let Event::Change { entry, .. } = events.recv().await.unwrap() {
                users.push(entry.user);
            }
        }
        assert_eq!(users, vec!["before", "after"]);
    }
}
