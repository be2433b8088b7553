//! Per-channel append-only logs with content-addressed entries.
//!
//! Every entry is identified by the blake3 hash of its canonical JSON
//! encoding, so appending the same entry twice (or receiving it from two
//! peers) stores exactly one copy. A [`ChannelLog`] supports appending,
//! reading all entries plus a live tail, and exposing its identity set for
//! replication.

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::store::{KvStore, StoreError};

/// Content address of a log entry: blake3 over the canonical JSON encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId([u8; 32]);

impl EntryId {
    /// Compute the id for an already canonically-encoded entry.
    pub fn for_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// The raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Shortened hex form for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..4])
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", data_encoding::HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self.fmt_short())
    }
}

/// Message payload: either plain text or a list of strings.
///
/// Serialized untagged so the wire shape is exactly a JSON string or array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    List(Vec<String>),
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Text(text) => write!(f, "{text}"),
            Payload::List(items) => write!(f, "{}", items.join(" ")),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Vec<String>> for Payload {
    fn from(items: Vec<String>) -> Self {
        Payload::List(items)
    }
}

/// A single chat log entry.
///
/// Immutable once appended. The wire and storage shape is
/// `{"time":<int ms>,"user":<string>,"data":<string|array>}` and
/// round-trips exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Wall clock at the author, milliseconds since the unix epoch.
    pub time: u64,
    /// Author identifier. Free-form, not authenticated.
    pub user: String,
    /// Message payload.
    pub data: Payload,
}

impl LogEntry {
    pub fn new(time: u64, user: impl Into<String>, data: impl Into<Payload>) -> Self {
        Self {
            time,
            user: user.into(),
            data: data.into(),
        }
    }

    /// Entry authored now by `user`.
    pub fn now(user: impl Into<String>, data: impl Into<Payload>) -> Self {
        Self::new(now_ms(), user, data)
    }

    /// Canonical JSON encoding. This is both the wire and the storage form,
    /// and the preimage of [`Self::id`].
    pub fn to_wire(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("log entry serialization is infallible")
    }

    /// Decode from the canonical JSON encoding.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Content address of this entry.
    ///
    /// Computed over the re-canonicalized encoding, so entries received
    /// with different JSON formatting still deduplicate.
    pub fn id(&self) -> EntryId {
        EntryId::for_bytes(&self.to_wire())
    }
}

/// Current wall clock in milliseconds since the unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Append-only log for one channel, persisted in a [`KvStore`] keyspace.
///
/// Entries live under `log/<channel>/<seq>` with an id index under
/// `ids/<channel>/<id>`. Reopening a log over the same store restores all
/// entries and the known-id set, so replication stays idempotent across
/// restarts. Entries are never reordered or rewritten.
#[derive(Debug)]
pub struct ChannelLog {
    channel: String,
    store: Arc<dyn KvStore>,
    state: Mutex<LogState>,
}

#[derive(Debug)]
struct LogState {
    next_seq: u64,
    ids: HashSet<EntryId>,
    entries: Vec<LogEntry>,
    subscribers: Vec<async_channel::Sender<LogEntry>>,
}

impl ChannelLog {
    /// Open (or create) the log for `channel`, loading any stored entries.
    pub fn open(store: Arc<dyn KvStore>, channel: &str) -> Result<Self, StoreError> {
        let mut entries = Vec::new();
        let mut ids = HashSet::new();
        for (key, value) in store.scan_prefix(entry_prefix(channel).as_bytes())? {
            let entry = LogEntry::from_wire(&value).map_err(|err| {
                StoreError::Corrupt(format!("{}: {err}", String::from_utf8_lossy(&key)))
            })?;
            ids.insert(EntryId::for_bytes(&value));
            entries.push(entry);
        }
        let next_seq = entries.len() as u64;
        Ok(Self {
            channel: channel.to_string(),
            store,
            state: Mutex::new(LogState {
                next_seq,
                ids,
                entries,
                subscribers: Vec::new(),
            }),
        })
    }

    /// The channel this log belongs to.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Append an entry.
    ///
    /// Returns the entry id and whether it was newly inserted. Appending a
    /// known entry is a no-op that does not wake live readers. Fails only
    /// if the backing store fails.
    pub fn append(&self, entry: LogEntry) -> Result<(EntryId, bool), StoreError> {
        let bytes = entry.to_wire();
        let id = EntryId::for_bytes(&bytes);
        let mut state = self.state.lock().expect("poisoned");
        if state.ids.contains(&id) {
            trace!(channel = %self.channel, id = %id.fmt_short(), "append: duplicate");
            return Ok((id, false));
        }
        let seq = state.next_seq;
        // id index first: a failure between the two writes then leaves only
        // a stray index record, which open never reads, instead of an entry
        // the in-memory state has not acknowledged
        self.store.put(id_key(&self.channel, &id).as_bytes(), &[])?;
        self.store.put(entry_key(&self.channel, seq).as_bytes(), &bytes)?;
        state.next_seq += 1;
        state.ids.insert(id);
        state.entries.push(entry.clone());
        // unbounded senders only fail when the receiver is gone
        state
            .subscribers
            .retain(|tx| tx.try_send(entry.clone()).is_ok());
        trace!(channel = %self.channel, id = %id.fmt_short(), seq, "append");
        Ok((id, true))
    }

    /// Snapshot of all entries plus a live receiver for later appends.
    ///
    /// The snapshot and the registration happen atomically: every entry is
    /// delivered exactly once, either in the snapshot or on the receiver.
    /// A new call restarts from the beginning of the log.
    pub fn subscribe(&self) -> (Vec<LogEntry>, async_channel::Receiver<LogEntry>) {
        let mut state = self.state.lock().expect("poisoned");
        let snapshot = state.entries.clone();
        let (tx, rx) = async_channel::unbounded();
        state.subscribers.push(tx);
        (snapshot, rx)
    }

    /// Whether an entry with this id is stored.
    pub fn contains(&self, id: &EntryId) -> bool {
        self.state.lock().expect("poisoned").ids.contains(id)
    }

    /// Ids of all stored entries.
    pub fn entry_ids(&self) -> Vec<EntryId> {
        self.state
            .lock()
            .expect("poisoned")
            .ids
            .iter()
            .copied()
            .collect()
    }

    /// All stored entries in append order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.state.lock().expect("poisoned").entries.clone()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.state.lock().expect("poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn entry_prefix(channel: &str) -> String {
    format!("log/{channel}/")
}

fn entry_key(channel: &str, seq: u64) -> String {
    // fixed-width hex keeps the key order equal to the append order
    format!("log/{channel}/{seq:016x}")
}

fn id_key(channel: &str, id: &EntryId) -> String {
    format!("ids/{channel}/{id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn open(store: &MemStore, channel: &str) -> ChannelLog {
        ChannelLog::open(Arc::new(store.clone()), channel).unwrap()
    }

    #[test]
    fn wire_shape_round_trips() {
        let entry = LogEntry::new(1234, "alice", "hello");
        let bytes = entry.to_wire();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"time":1234,"user":"alice","data":"hello"}"#
        );
        assert_eq!(LogEntry::from_wire(&bytes).unwrap(), entry);

        let entry = LogEntry::new(9, "bob", vec!["a".to_string(), "b".to_string()]);
        let bytes = entry.to_wire();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"time":9,"user":"bob","data":["a","b"]}"#
        );
        assert_eq!(LogEntry::from_wire(&bytes).unwrap(), entry);
    }

    #[test]
    fn id_ignores_formatting() {
        let entry = LogEntry::new(7, "carol", "hi");
        let pretty = serde_json::to_vec_pretty(&entry).unwrap();
        let reparsed = LogEntry::from_wire(&pretty).unwrap();
        assert_eq!(entry.id(), reparsed.id());
    }

    #[test]
    fn append_deduplicates() {
        let store = MemStore::new();
        let log = open(&store, "general");
        let entry = LogEntry::new(1, "alice", "hello");

        let (id1, inserted1) = log.append(entry.clone()).unwrap();
        let (id2, inserted2) = log.append(entry).unwrap();
        assert_eq!(id1, id2);
        assert!(inserted1);
        assert!(!inserted2);
        assert_eq!(log.len(), 1);
        assert!(log.contains(&id1));
    }

    #[tokio::test]
    async fn subscribe_yields_snapshot_then_live() {
        let store = MemStore::new();
        let log = open(&store, "general");
        log.append(LogEntry::new(1, "a", "one")).unwrap();
        log.append(LogEntry::new(2, "a", "two")).unwrap();

        let (snapshot, rx) = log.subscribe();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].data, Payload::Text("one".into()));

        log.append(LogEntry::new(3, "b", "three")).unwrap();
        let live = rx.recv().await.unwrap();
        assert_eq!(live.data, Payload::Text("three".into()));

        // a duplicate append must not wake the live reader
        log.append(LogEntry::new(3, "b", "three")).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_append_via_two_subscribers_is_stored_once() {
        let store = MemStore::new();
        let log = open(&store, "general");
        let (_, rx_a) = log.subscribe();
        let (_, rx_b) = log.subscribe();

        // same content arriving from two replication sessions
        let entry = LogEntry::new(5, "mallory", "dup");
        log.append(entry.clone()).unwrap();
        log.append(entry).unwrap();

        assert_eq!(log.len(), 1);
        assert!(rx_a.recv().await.is_ok());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.recv().await.is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn reopen_restores_entries_and_ids() {
        let store = MemStore::new();
        let entry = LogEntry::new(1, "alice", "persisted");
        let id = {
            let log = open(&store, "general");
            log.append(entry.clone()).unwrap().0
        };

        let log = open(&store, "general");
        assert_eq!(log.entries(), vec![entry.clone()]);
        assert!(log.contains(&id));
        // the reloaded id set still deduplicates
        assert!(!log.append(entry).unwrap().1);
    }

    #[test]
    fn failed_append_leaves_no_partial_record() {
        // fails the id index write; whichever order the two appends writes
        // its keys in, no entry may surface that the append call rejected
        #[derive(Debug)]
        struct HalfBrokenStore(MemStore);

        impl KvStore for HalfBrokenStore {
            fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
                if key.starts_with(b"ids/") {
                    return Err(StoreError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "disk full",
                    )));
                }
                self.0.put(key, value)
            }

            fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
                self.0.get(key)
            }

            fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
                self.0.scan_prefix(prefix)
            }
        }

        let backing = MemStore::new();
        let log = ChannelLog::open(
            Arc::new(HalfBrokenStore(backing.clone())),
            "general",
        )
        .unwrap();
        assert!(log.append(LogEntry::new(1, "a", "lost")).is_err());
        assert_eq!(log.len(), 0);

        // reopening over the backing store surfaces no phantom entry
        let reopened = open(&backing, "general");
        assert!(reopened.is_empty());
        assert!(backing.scan_prefix(b"log/general/").unwrap().is_empty());
    }

    #[test]
    fn channels_are_isolated_keyspaces() {
        let store = MemStore::new();
        let general = open(&store, "general");
        let random = open(&store, "random");
        general.append(LogEntry::new(1, "a", "only general")).unwrap();
        assert!(random.is_empty());
    }
}
