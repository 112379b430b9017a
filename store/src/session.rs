//! The filesystem-session model shared by the store backend and the
//! sessions layered over it.
//!
//! Node operations are synchronous calls; file content moves through
//! READ/WRITE packets. A server acknowledges packets in arbitrary
//! order, so callers match acknowledgements to their submissions by
//! `(handle, operation, position)`.

use std::sync::Arc;

use crate::errors::FsError;

/// Longest permitted name of a single directory entry.
pub const MAX_NAME_LEN: usize = 128;

/// Longest permitted path.
pub const MAX_PATH_LEN: usize = 1024;

/// Bound on packets in flight per session.
pub const TX_QUEUE_SIZE: usize = 32;

/// An opaque node handle within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u32);

/// Open mode of a file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Mode {
    pub fn writeable(&self) -> bool {
        !matches!(self, Mode::ReadOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
}

/// Status of an open node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// File: content length. Directory: listing length in bytes.
    /// Symlink: target length.
    pub size: u64,
    pub kind: NodeKind,
}

/// Miscellaneous handle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Flush the node to durable storage.
    Sync,
}

/// Change-notification receiver registered with [`FsSession::sigh`].
pub type Notifier = Arc<tokio::sync::Notify>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOp {
    Read,
    Write,
}

/// One packet of the content transport.
#[derive(Debug, Clone)]
pub struct Packet {
    pub handle: Handle,
    pub op: PacketOp,
    /// Byte position within the node.
    pub position: u64,
    /// Requested transfer length; updated to the transferred length on
    /// acknowledgement.
    pub length: usize,
    /// WRITE: the bytes to commit. READ: filled by the server.
    pub payload: Vec<u8>,
    pub succeeded: bool,
}

impl Packet {
    pub fn read(handle: Handle, position: u64, length: usize) -> Self {
        Packet {
            handle,
            op: PacketOp::Read,
            position,
            length,
            payload: Vec::new(),
            succeeded: false,
        }
    }

    pub fn write(handle: Handle, position: u64, payload: Vec<u8>) -> Self {
        Packet {
            handle,
            op: PacketOp::Write,
            position,
            length: payload.len(),
            payload,
            succeeded: false,
        }
    }

    /// True if `other` acknowledges this submission.
    pub fn matches(&self, other: &Packet) -> bool {
        self.handle == other.handle && self.op == other.op && self.position == other.position
    }
}

/// A directory-listing record, serialized into [`DIRENT_SIZE`] bytes:
/// a kind tag, a length byte and the (unterminated) name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub kind: NodeKind,
    pub name: String,
}

pub const DIRENT_SIZE: usize = 2 + MAX_NAME_LEN;

impl DirEntry {
    pub fn encode(&self) -> [u8; DIRENT_SIZE] {
        let mut out = [0u8; DIRENT_SIZE];
        out[0] = match self.kind {
            NodeKind::File => 0,
            NodeKind::Directory => 1,
            NodeKind::Symlink => 2,
        };
        let name = self.name.as_bytes();
        debug_assert!(name.len() <= MAX_NAME_LEN);
        out[1] = name.len() as u8;
        out[2..2 + name.len()].copy_from_slice(name);
        out
    }

    pub fn decode(buf: &[u8]) -> Option<DirEntry> {
        if buf.len() < DIRENT_SIZE {
            return None;
        }
        let kind = match buf[0] {
            0 => NodeKind::File,
            1 => NodeKind::Directory,
            2 => NodeKind::Symlink,
            _ => return None,
        };
        let len = buf[1] as usize;
        if len > MAX_NAME_LEN {
            return None;
        }
        let name = std::str::from_utf8(&buf[2..2 + len]).ok()?;
        Some(DirEntry {
            kind,
            name: name.to_string(),
        })
    }
}

/// One filesystem session.
///
/// Any operation may fail with [`FsError::InvalidHandle`],
/// [`FsError::LookupFailed`], [`FsError::PermissionDenied`],
/// [`FsError::NodeAlreadyExists`], [`FsError::NotEmpty`],
/// [`FsError::NoSpace`], [`FsError::OutOfMetadata`] or
/// [`FsError::NameTooLong`] as applicable.
pub trait FsSession: Send {
    /// Open (or create) a directory by absolute path.
    fn dir(&mut self, path: &str, create: bool) -> Result<Handle, FsError>;

    /// Open (or create) a file within an open directory.
    fn file(&mut self, dir: Handle, name: &str, mode: Mode, create: bool)
        -> Result<Handle, FsError>;

    /// Open (or create) a symlink within an open directory. The target
    /// is read and written through packets on the returned handle.
    fn symlink(&mut self, dir: Handle, name: &str, create: bool) -> Result<Handle, FsError>;

    /// Open a node of any kind by absolute path, read-only.
    fn node(&mut self, path: &str) -> Result<Handle, FsError>;

    fn status(&mut self, handle: Handle) -> Result<Status, FsError>;

    fn close(&mut self, handle: Handle);

    fn unlink(&mut self, dir: Handle, name: &str) -> Result<(), FsError>;

    fn truncate(&mut self, handle: Handle, len: u64) -> Result<(), FsError>;

    fn rename(
        &mut self,
        from_dir: Handle,
        from_name: &str,
        to_dir: Handle,
        to_name: &str,
    ) -> Result<(), FsError>;

    fn sigh(&mut self, handle: Handle, notifier: Notifier) -> Result<(), FsError>;

    fn control(&mut self, handle: Handle, op: Control) -> Result<(), FsError>;

    /// Submit a packet. The acknowledgement arrives via
    /// [`FsSession::next_ack`]; failures are reported as acknowledged
    /// packets with `succeeded == false`.
    fn submit(&mut self, packet: Packet);

    /// Take the next acknowledged packet, if any.
    fn next_ack(&mut self) -> Option<Packet>;
}

/// Split `path` into its first element and the rest.
///
/// `"/a/b/c"` becomes `("a", "b/c")`; a single element yields an empty
/// rest.
pub(crate) fn split_first_element(path: &str) -> (&str, &str) {
    let path = path.strip_prefix('/').unwrap_or(path);
    match path.split_once('/') {
        Some((first, rest)) => (first, rest),
        None => (path, ""),
    }
}
