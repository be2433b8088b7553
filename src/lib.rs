//! Peer-to-peer chat over per-channel replicated logs.
//!
//! Each channel is an append-only, content-addressed log. Peers for a
//! channel are discovered through a rendezvous service, connected over
//! direct bidirectional byte streams, and kept in sync by streaming log
//! replication in both directions. There is no server-side authority and
//! no total order across peers; the display layer reconciles by entry
//! timestamp.
//!
//! The entry point is [`Client`]: join channels, send messages, and
//! subscribe to [`Event`]s. Storage and rendezvous are pluggable through
//! the [`store::KvStore`] and [`rendezvous::Rendezvous`] traits; in-memory
//! implementations for both are included.

pub mod client;
pub mod commands;
pub mod log;
pub mod proto;
pub mod rendezvous;
pub mod store;

mod net;
mod session;

pub use client::{Client, ChannelView, ClientBuilder, Event, STATUS_CHANNEL, STATUS_USER};
pub use log::{ChannelLog, EntryId, LogEntry, Payload};
pub use rendezvous::{topic_id, MemoryRendezvous, PeerId, PeerLink, Rendezvous, Subscription, TopicId};
pub use store::{KvStore, MemStore, StoreError};
