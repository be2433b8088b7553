//! Replication session for one (channel, peer) pair.
//!
//! Wires a [`ChannelLog`] to a [`PeerLink`] in both directions. Each side
//! opens by listing its entry ids in `Have` frames, batched so no frame
//! exceeds the size limit however large the history is; on receiving a
//! remote `Have`, it sends every local entry the remote lacks, and keeps
//! forwarding live appends. Received entries are appended with
//! content-address deduplication. A per-session set of ids the remote is
//! known to hold keeps the exchange minimal; the two directions never
//! block each other.
//!
//! Faults are typed and contained: a session that fails reports its
//! [`SessionError`] to the caller and releases both stream halves; it
//! never affects other sessions or channels.

use std::{
    collections::HashSet,
    io,
    sync::{Arc, Mutex},
};

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    log::{ChannelLog, EntryId, LogEntry},
    proto::{read_frame, write_frame, Frame, FrameError},
    rendezvous::PeerLink,
    store::StoreError,
};

/// Why a replication session ended abnormally.
#[derive(Debug, thiserror::Error)]
pub(crate) enum SessionError {
    /// The peer stream failed or ended mid-frame.
    #[error("link fault: {0}")]
    Link(#[source] io::Error),
    /// The peer sent bytes we cannot decode. The peer is treated as
    /// faulty and the session is torn down.
    #[error("decode fault: {0}")]
    Decode(String),
    /// The local store failed while applying a replicated entry.
    #[error("storage fault: {0}")]
    Storage(#[from] StoreError),
}

impl From<FrameError> for SessionError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(err) => SessionError::Link(err),
            FrameError::Oversized(size) => {
                SessionError::Decode(format!("frame of {size} bytes exceeds limit"))
            }
            FrameError::Codec(err) => SessionError::Decode(err.to_string()),
        }
    }
}

/// Frame errors on the send side are local link faults, never `Decode`:
/// that variant attributes the bytes to the peer.
fn send_fault(err: FrameError) -> SessionError {
    match err {
        FrameError::Io(err) => SessionError::Link(err),
        FrameError::Oversized(size) => SessionError::Link(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("outgoing frame of {size} bytes exceeds limit"),
        )),
        FrameError::Codec(err) => {
            SessionError::Link(io::Error::new(io::ErrorKind::InvalidData, err))
        }
    }
}

/// Ids per `Have` frame. 32 bytes each plus framing overhead, so a full
/// batch stays far below [`crate::proto::MAX_FRAME_SIZE`].
const HAVE_BATCH: usize = 4096;

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Decode(err.to_string())
    }
}

/// Run replication over `link` until the stream ends, a direction faults,
/// or `cancel` fires. Cancellation is a clean end.
pub(crate) async fn run(
    log: Arc<ChannelLog>,
    link: PeerLink,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    let PeerLink { peer, stream } = link;
    let (mut reader, mut writer) = tokio::io::split(stream);
    // snapshot and live tail are atomic: nothing appended after the
    // snapshot is missed by the live receiver
    let (snapshot, live) = log.subscribe();
    let have: Vec<EntryId> = snapshot.iter().map(LogEntry::id).collect();

    // ids the remote is known to hold; the single gate for every send
    let known: Arc<Mutex<HashSet<EntryId>>> = Default::default();
    // entries the remote lacks, queued by the receiving direction
    let (missing_tx, mut missing_rx) = mpsc::unbounded_channel::<LogEntry>();

    let send_known = known.clone();
    let send_loop = async {
        // an empty history still announces itself, so the remote knows
        // to send everything
        if have.is_empty() {
            write_frame(&mut writer, &Frame::Have(Vec::new()))
                .await
                .map_err(send_fault)?;
        }
        for batch in have.chunks(HAVE_BATCH) {
            write_frame(&mut writer, &Frame::Have(batch.to_vec()))
                .await
                .map_err(send_fault)?;
        }
        loop {
            let entry = tokio::select! {
                queued = missing_rx.recv() => match queued {
                    Some(entry) => entry,
                    None => break,
                },
                live = live.recv() => match live {
                    Ok(entry) => entry,
                    Err(_) => break,
                },
            };
            let bytes = entry.to_wire();
            let id = EntryId::for_bytes(&bytes);
            if send_known.lock().expect("poisoned").insert(id) {
                trace!(id = %id.fmt_short(), "sending entry");
                write_frame(&mut writer, &Frame::Entry(bytes))
                    .await
                    .map_err(send_fault)?;
            }
        }
        Ok::<_, SessionError>(())
    };

    let recv_known = known.clone();
    let recv_log = log.clone();
    let recv_loop = async {
        let mut buffer = BytesMut::new();
        loop {
            match read_frame(&mut reader, &mut buffer).await? {
                // remote closed cleanly
                None => break,
                Some(Frame::Have(ids)) => {
                    trace!(count = ids.len(), "received have");
                    // filter against the cumulative set: ids from earlier
                    // batches and entries already received stay out of the
                    // missing queue
                    let missing: Vec<LogEntry> = {
                        let mut known = recv_known.lock().expect("poisoned");
                        known.extend(ids);
                        recv_log
                            .entries()
                            .into_iter()
                            .filter(|entry| !known.contains(&entry.id()))
                            .collect()
                    };
                    for entry in missing {
                        // send loop gone means the session is ending
                        if missing_tx.send(entry).is_err() {
                            break;
                        }
                    }
                }
                Some(Frame::Entry(bytes)) => {
                    let entry = LogEntry::from_wire(&bytes)?;
                    let id = entry.id();
                    recv_known.lock().expect("poisoned").insert(id);
                    let (_, inserted) = recv_log.append(entry)?;
                    trace!(id = %id.fmt_short(), inserted, "received entry");
                }
            }
        }
        Ok::<_, SessionError>(())
    };

    tokio::pin!(send_loop);
    tokio::pin!(recv_loop);
    let res = tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(()),
        res = &mut send_loop => res,
        res = &mut recv_loop => res,
    };
    debug!(peer = %peer.fmt_short(), ok = res.is_ok(), "session ended");
    // both halves are dropped here, releasing the link
    res
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    use super::*;
    use crate::rendezvous::PeerId;
    use crate::store::MemStore;

    fn open_log(store: &MemStore, channel: &str) -> Arc<ChannelLog> {
        Arc::new(ChannelLog::open(Arc::new(store.clone()), channel).unwrap())
    }

    fn linked_pair() -> (PeerLink, PeerLink) {
        let (a, b) = tokio::io::duplex(1 << 16);
        (
            PeerLink {
                peer: PeerId::random(),
                stream: Box::new(a),
            },
            PeerLink {
                peer: PeerId::random(),
                stream: Box::new(b),
            },
        )
    }

    async fn wait_for_len(log: &ChannelLog, len: usize) {
        timeout(Duration::from_secs(5), async {
            loop {
                if log.len() >= len {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("logs did not converge");
    }

    #[tokio::test]
    async fn sessions_exchange_history_and_live_entries() {
        let log_a = open_log(&MemStore::new(), "general");
        let log_b = open_log(&MemStore::new(), "general");
        log_a.append(LogEntry::new(1, "alice", "from a")).unwrap();
        log_b.append(LogEntry::new(2, "bob", "from b")).unwrap();

        let (link_a, link_b) = linked_pair();
        let cancel = CancellationToken::new();
        let task_a = tokio::spawn(run(log_a.clone(), link_a, cancel.child_token()));
        let task_b = tokio::spawn(run(log_b.clone(), link_b, cancel.child_token()));

        wait_for_len(&log_a, 2).await;
        wait_for_len(&log_b, 2).await;

        // live entries keep flowing after the initial exchange
        log_a.append(LogEntry::new(3, "alice", "live")).unwrap();
        wait_for_len(&log_b, 3).await;
        assert_eq!(log_a.entry_ids().len(), 3);
        assert_eq!(
            {
                let mut ids = log_a.entry_ids();
                ids.sort();
                ids
            },
            {
                let mut ids = log_b.entry_ids();
                ids.sort();
                ids
            }
        );

        cancel.cancel();
        assert!(task_a.await.unwrap().is_ok());
        assert!(task_b.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn history_larger_than_one_frame_replicates() {
        // enough ids that the announcement cannot fit a single frame
        let count = HAVE_BATCH * 10;
        let log_a = open_log(&MemStore::new(), "general");
        let log_b = open_log(&MemStore::new(), "general");
        for i in 0..count {
            log_a
                .append(LogEntry::new(i as u64, "alice", format!("msg {i}")))
                .unwrap();
        }

        let (link_a, link_b) = linked_pair();
        let cancel = CancellationToken::new();
        let task_a = tokio::spawn(run(log_a.clone(), link_a, cancel.child_token()));
        let task_b = tokio::spawn(run(log_b.clone(), link_b, cancel.child_token()));

        timeout(Duration::from_secs(60), async {
            while log_b.len() < count {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("large history did not converge");
        assert_eq!(log_b.len(), count);

        cancel.cancel();
        assert!(task_a.await.unwrap().is_ok());
        assert!(task_b.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn shared_history_is_not_resent() {
        // both sides already hold the same entry; after the have exchange
        // neither may append anything new
        let store_a = MemStore::new();
        let store_b = MemStore::new();
        let log_a = open_log(&store_a, "general");
        let log_b = open_log(&store_b, "general");
        let shared = LogEntry::new(1, "alice", "both have this");
        log_a.append(shared.clone()).unwrap();
        log_b.append(shared).unwrap();

        let (_, live_a) = log_a.subscribe();
        let (_, live_b) = log_b.subscribe();

        let (link_a, link_b) = linked_pair();
        let cancel = CancellationToken::new();
        tokio::spawn(run(log_a.clone(), link_a, cancel.child_token()));
        tokio::spawn(run(log_b.clone(), link_b, cancel.child_token()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(log_a.len(), 1);
        assert_eq!(log_b.len(), 1);
        assert!(live_a.try_recv().is_err());
        assert!(live_b.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn remote_close_ends_the_session_cleanly() {
        let log = open_log(&MemStore::new(), "general");
        let (link, remote) = linked_pair();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(log, link, cancel));
        drop(remote);
        let res = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn garbage_from_peer_is_a_decode_fault() {
        let log = open_log(&MemStore::new(), "general");
        let (link, mut remote) = linked_pair();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(log, link, cancel));

        // a length prefix followed by bytes that are not a frame
        remote.stream.write_u32(4).await.unwrap();
        remote.stream.write_all(&[0xff; 4]).await.unwrap();

        let res = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(res, Err(SessionError::Decode(_))));
    }

    #[tokio::test]
    async fn malformed_entry_is_a_decode_fault() {
        let log = open_log(&MemStore::new(), "general");
        let (link, remote) = linked_pair();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(log, link, cancel));

        let mut stream = remote.stream;
        write_frame(&mut stream, &Frame::Entry(b"not json".to_vec()))
            .await
            .unwrap();

        let res = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(res, Err(SessionError::Decode(_))));
    }
}
