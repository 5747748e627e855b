//! Weft wire protocol
//!
//! Every node in a weft deployment speaks the same framed protocol:
//! a 4-byte big-endian length prefix followed by one UTF-8 JSON message.
//! One request produces exactly one response on the same connection.
//!
//! # Architecture
//!
//! ```text
//!  ┌────────┐  REGISTER / UPDATE_LOAD    ┌─────────┐
//!  │ Peer A │◄──────────────────────────►│ Tracker │
//!  └────────┘                            └─────────┘
//!      ▲                                      ▲
//!      │ CPU_TASK / UPLOAD_TO_PEER / ...      │
//!      ▼                                      │
//!  ┌────────┐  REGISTER / heartbeat          │
//!  │ Peer B │◄────────────────────────────────┘
//!  └────────┘
//! ```
//!
//! ## Roles
//! - The tracker keeps the peer directory, the public file directory and the
//!   persistent owned-file registry.
//! - Peers serve compute, memory and file operations, and act as clients
//!   towards the tracker and towards each other.

pub mod message;
pub mod types;
pub mod wire;

pub use message::{ErrorKind, Message, TaskResult};
pub use types::{Discipline, PeerAddr, PeerId, TaskSpec, TaskStatus};
pub use wire::{read_message, request, write_message, WireError};
