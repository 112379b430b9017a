//! The store filesystem layer: a session model over a flat store
//! directory, a disk-backed implementation of it, and the hashing
//! sessions (ingest, filter) that mediate what build processes may read
//! and write.

mod errors;
mod filter;
mod ingest;
mod local;
mod session;
mod tree;
pub mod util;

pub use errors::FsError;
pub use filter::FilterSession;
pub use ingest::{IngestSession, MAX_NODE_HANDLES, MAX_ROOT_NODES, ROOT_HANDLE_PREFIX};
pub use local::LocalStore;
pub use session::{
    Control, DirEntry, FsSession, Handle, Mode, NodeKind, Notifier, Packet, PacketOp, Status,
    DIRENT_SIZE, MAX_NAME_LEN, MAX_PATH_LEN, TX_QUEUE_SIZE,
};
pub use tree::{DirectoryNode, FileNode, Node, SymlinkNode, DIGEST_SIZE};
