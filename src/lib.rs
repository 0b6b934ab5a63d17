//! Two-phase commit over a small, statically configured cluster.
//!
//! Every node holds one signed-integer register. A transaction adds a delta
//! to the register on every node or on none: the coordinator reserves the
//! value everywhere (prepare), and only commits once the vote is unanimous.
//! Each module covers one concrete responsibility:
//!
//! - [`message`] defines the wire/log types and the length-prefixed binary
//!   framing shared by the RPC layer and the write-ahead log.
//! - [`volatile`] holds the in-memory register and the single prepare lock
//!   that serializes transactions on a node.
//! - [`stable`] is the durable side: fsynced write-ahead log, snapshot
//!   checkpoint, and the presumed-abort status lookup.
//! - [`peer`] dials cluster members on demand and enforces per-call
//!   deadlines.
//! - [`broadcast`] fans a request out to all peers in parallel.
//! - [`node`] ties it together: coordinator algorithm, participant RPC
//!   handlers, and crash recovery.
//! - [`cli`] parses the demo binary's command line.
//!
//! Integration tests spawn real TCP clusters against this crate directly.

pub mod broadcast;
pub mod cli;
pub mod error;
pub mod message;
pub mod node;
pub mod peer;
pub mod stable;
pub mod volatile;

pub use error::{Error, Result};
pub use node::{Node, NodeConfig};
