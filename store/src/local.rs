//! Disk-backed filesystem session over one flat store directory.
//!
//! This plays the part of the durable random-access filesystem the
//! store components connect to. Several sessions may be open over the
//! same directory; each has its own handle space and packet queue.

use std::collections::VecDeque;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::errors::FsError;
use crate::session::{
    Control, DirEntry, FsSession, Handle, Mode, NodeKind, Notifier, Packet, PacketOp, Status,
    DIRENT_SIZE, MAX_NAME_LEN,
};

/// Open handles per session.
const MAX_OPEN_NODES: usize = 128;

struct OpenNode {
    /// Path relative to the store root; empty for the root itself.
    rel: PathBuf,
    kind: NodeKind,
    mode: Mode,
}

pub struct LocalStore {
    root: PathBuf,
    writeable: bool,
    nodes: Vec<Option<OpenNode>>,
    acks: VecDeque<Packet>,
    notifiers: Vec<(Handle, Notifier)>,
}

impl LocalStore {
    /// Open a session over `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, FsError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(LocalStore {
            root,
            writeable: true,
            nodes: Vec::new(),
            acks: VecDeque::new(),
            notifiers: Vec::new(),
        })
    }

    /// Open a session that refuses every mutating operation.
    pub fn open_read_only(root: impl Into<PathBuf>) -> Result<Self, FsError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(FsError::LookupFailed);
        }
        Ok(LocalStore {
            root,
            writeable: false,
            nodes: Vec::new(),
            acks: VecDeque::new(),
            notifiers: Vec::new(),
        })
    }

    fn check_writeable(&self) -> Result<(), FsError> {
        if self.writeable {
            Ok(())
        } else {
            Err(FsError::PermissionDenied)
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    fn alloc(&mut self, node: OpenNode) -> Result<Handle, FsError> {
        for (i, slot) in self.nodes.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(node);
                return Ok(Handle(i as u32));
            }
        }
        if self.nodes.len() >= MAX_OPEN_NODES {
            return Err(FsError::OutOfNodeHandles);
        }
        self.nodes.push(Some(node));
        Ok(Handle((self.nodes.len() - 1) as u32))
    }

    fn get(&self, handle: Handle) -> Result<&OpenNode, FsError> {
        self.nodes
            .get(handle.0 as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or(FsError::InvalidHandle)
    }

    /// Validate a client path and make it root-relative.
    fn resolve(&self, path: &str) -> Result<PathBuf, FsError> {
        let mut rel = PathBuf::new();
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        if trimmed.is_empty() {
            return Ok(rel);
        }
        for element in trimmed.split('/') {
            if element.is_empty() || element == "." || element == ".." {
                return Err(FsError::LookupFailed);
            }
            if element.len() > MAX_NAME_LEN {
                return Err(FsError::NameTooLong);
            }
            rel.push(element);
        }
        Ok(rel)
    }

    fn child_rel(&self, dir: Handle, name: &str) -> Result<PathBuf, FsError> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(FsError::LookupFailed);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong);
        }
        let node = self.get(dir)?;
        if node.kind != NodeKind::Directory {
            return Err(FsError::InvalidHandle);
        }
        Ok(node.rel.join(name))
    }

    fn kind_at(&self, rel: &Path) -> Result<NodeKind, FsError> {
        let meta = fs::symlink_metadata(self.root.join(rel))?;
        Ok(if meta.file_type().is_dir() {
            NodeKind::Directory
        } else if meta.file_type().is_symlink() {
            NodeKind::Symlink
        } else {
            NodeKind::File
        })
    }

    /// Sorted listing of a directory, already serialized.
    fn listing(&self, rel: &Path) -> Result<Vec<u8>, FsError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.root.join(rel))? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let kind = if file_type.is_dir() {
                NodeKind::Directory
            } else if file_type.is_symlink() {
                NodeKind::Symlink
            } else {
                NodeKind::File
            };
            match entry.file_name().into_string() {
                Ok(name) if name.len() <= MAX_NAME_LEN => names.push(DirEntry { kind, name }),
                _ => continue,
            }
        }
        names.sort_by(|a, b| a.name.cmp(&b.name));
        let mut out = Vec::with_capacity(names.len() * DIRENT_SIZE);
        for entry in &names {
            out.extend_from_slice(&entry.encode());
        }
        Ok(out)
    }

    fn notify(&self, handle: Handle) {
        for (registered, notifier) in &self.notifiers {
            if *registered == handle {
                notifier.notify_waiters();
            }
        }
    }

    fn execute(&mut self, packet: &mut Packet) -> Result<(), FsError> {
        let node = self.get(packet.handle)?;
        let full = self.root.join(&node.rel);
        match (packet.op, node.kind) {
            (PacketOp::Read, NodeKind::File) => {
                let mut file = fs::File::open(full)?;
                file.seek(SeekFrom::Start(packet.position))?;
                let mut buf = vec![0u8; packet.length];
                let mut filled = 0usize;
                loop {
                    let n = file.read(&mut buf[filled..])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                    if filled == buf.len() {
                        break;
                    }
                }
                buf.truncate(filled);
                packet.length = filled;
                packet.payload = buf;
            }
            (PacketOp::Read, NodeKind::Symlink) => {
                let target = fs::read_link(full)?;
                let bytes = target.as_os_str().as_encoded_bytes();
                let start = (packet.position as usize).min(bytes.len());
                let end = (start + packet.length).min(bytes.len());
                packet.payload = bytes[start..end].to_vec();
                packet.length = packet.payload.len();
            }
            (PacketOp::Read, NodeKind::Directory) => {
                let listing = self.listing(&node.rel)?;
                let start = (packet.position as usize).min(listing.len());
                let end = (start + packet.length).min(listing.len());
                packet.payload = listing[start..end].to_vec();
                packet.length = packet.payload.len();
            }
            (PacketOp::Write, NodeKind::File) => {
                if !node.mode.writeable() {
                    return Err(FsError::PermissionDenied);
                }
                let mut file = fs::OpenOptions::new().write(true).open(full)?;
                file.seek(SeekFrom::Start(packet.position))?;
                file.write_all(&packet.payload)?;
                packet.length = packet.payload.len();
            }
            (PacketOp::Write, NodeKind::Symlink) => {
                if !node.mode.writeable() {
                    return Err(FsError::PermissionDenied);
                }
                if packet.position != 0 {
                    return Err(FsError::PermissionDenied);
                }
                let target = std::str::from_utf8(&packet.payload)
                    .map_err(|_| FsError::PermissionDenied)?;
                if fs::symlink_metadata(&full).is_ok() {
                    fs::remove_file(&full)?;
                }
                std::os::unix::fs::symlink(target, &full)?;
                packet.length = packet.payload.len();
            }
            (PacketOp::Write, NodeKind::Directory) => {
                return Err(FsError::PermissionDenied);
            }
        }
        Ok(())
    }
}

impl FsSession for LocalStore {
    fn dir(&mut self, path: &str, create: bool) -> Result<Handle, FsError> {
        let rel = self.resolve(path)?;
        if create {
            self.check_writeable()?;
            if rel.as_os_str().is_empty() {
                return Err(FsError::NodeAlreadyExists);
            }
            fs::create_dir(self.root.join(&rel))?;
        } else if !rel.as_os_str().is_empty() && self.kind_at(&rel)? != NodeKind::Directory {
            return Err(FsError::LookupFailed);
        }
        self.alloc(OpenNode {
            rel,
            kind: NodeKind::Directory,
            mode: Mode::ReadWrite,
        })
    }

    fn file(
        &mut self,
        dir: Handle,
        name: &str,
        mode: Mode,
        create: bool,
    ) -> Result<Handle, FsError> {
        let rel = self.child_rel(dir, name)?;
        let full = self.root.join(&rel);
        if create || mode.writeable() {
            self.check_writeable()?;
        }
        if create {
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&full)?;
        } else if self.kind_at(&rel)? != NodeKind::File {
            return Err(FsError::LookupFailed);
        }
        self.alloc(OpenNode {
            rel,
            kind: NodeKind::File,
            mode,
        })
    }

    fn symlink(&mut self, dir: Handle, name: &str, create: bool) -> Result<Handle, FsError> {
        let rel = self.child_rel(dir, name)?;
        if create {
            self.check_writeable()?;
            if fs::symlink_metadata(self.root.join(&rel)).is_ok() {
                return Err(FsError::NodeAlreadyExists);
            }
            // the symlink appears on disk once its target is written
        } else if self.kind_at(&rel)? != NodeKind::Symlink {
            return Err(FsError::LookupFailed);
        }
        // symlink handles carry no open mode; the target is replaced
        // by writing, session permitting
        self.alloc(OpenNode {
            rel,
            kind: NodeKind::Symlink,
            mode: if self.writeable {
                Mode::ReadWrite
            } else {
                Mode::ReadOnly
            },
        })
    }

    fn node(&mut self, path: &str) -> Result<Handle, FsError> {
        let rel = self.resolve(path)?;
        let kind = if rel.as_os_str().is_empty() {
            NodeKind::Directory
        } else {
            self.kind_at(&rel)?
        };
        self.alloc(OpenNode {
            rel,
            kind,
            mode: Mode::ReadOnly,
        })
    }

    fn status(&mut self, handle: Handle) -> Result<Status, FsError> {
        let node = self.get(handle)?;
        let size = match node.kind {
            NodeKind::File => fs::symlink_metadata(self.root.join(&node.rel))?.len(),
            NodeKind::Directory => self.listing(&node.rel)?.len() as u64,
            NodeKind::Symlink => fs::read_link(self.root.join(&node.rel))?
                .as_os_str()
                .len() as u64,
        };
        Ok(Status {
            size,
            kind: node.kind,
        })
    }

    fn close(&mut self, handle: Handle) {
        if let Some(slot) = self.nodes.get_mut(handle.0 as usize) {
            *slot = None;
        }
        self.notifiers.retain(|(h, _)| *h != handle);
    }

    fn unlink(&mut self, dir: Handle, name: &str) -> Result<(), FsError> {
        self.check_writeable()?;
        let rel = self.child_rel(dir, name)?;
        let full = self.root.join(&rel);
        match self.kind_at(&rel)? {
            NodeKind::Directory => fs::remove_dir(full)?,
            _ => fs::remove_file(full)?,
        }
        Ok(())
    }

    fn truncate(&mut self, handle: Handle, len: u64) -> Result<(), FsError> {
        let node = self.get(handle)?;
        if node.kind != NodeKind::File || !node.mode.writeable() {
            return Err(FsError::PermissionDenied);
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .open(self.root.join(&node.rel))?;
        file.set_len(len)?;
        self.notify(handle);
        Ok(())
    }

    fn rename(
        &mut self,
        from_dir: Handle,
        from_name: &str,
        to_dir: Handle,
        to_name: &str,
    ) -> Result<(), FsError> {
        self.check_writeable()?;
        let from = self.child_rel(from_dir, from_name)?;
        let to = self.child_rel(to_dir, to_name)?;
        fs::rename(self.root.join(from), self.root.join(to))?;
        Ok(())
    }

    fn sigh(&mut self, handle: Handle, notifier: Notifier) -> Result<(), FsError> {
        self.get(handle)?;
        self.notifiers.push((handle, notifier));
        Ok(())
    }

    fn control(&mut self, handle: Handle, op: Control) -> Result<(), FsError> {
        let node = self.get(handle)?;
        match op {
            Control::Sync => {
                if node.kind == NodeKind::File {
                    fs::File::open(self.root.join(&node.rel))?.sync_all()?;
                }
                Ok(())
            }
        }
    }

    fn submit(&mut self, mut packet: Packet) {
        match self.execute(&mut packet) {
            Ok(()) => {
                packet.succeeded = true;
                if packet.op == PacketOp::Write {
                    self.notify(packet.handle);
                }
            }
            Err(e) => {
                warn!(handle = packet.handle.0, ?e, "packet failed");
                packet.succeeded = false;
                packet.length = 0;
            }
        }
        self.acks.push_back(packet);
    }

    fn next_ack(&mut self) -> Option<Packet> {
        self.acks.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, LocalStore) {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn create_write_read_file() {
        let (_tmp, mut fs) = store();
        let root = fs.dir("/", false).unwrap();
        let file = fs.file(root, "data", Mode::ReadWrite, true).unwrap();

        fs.submit(Packet::write(file, 0, b"hello".to_vec()));
        let ack = fs.next_ack().unwrap();
        assert!(ack.succeeded);

        fs.submit(Packet::read(file, 0, 16));
        let ack = fs.next_ack().unwrap();
        assert!(ack.succeeded);
        assert_eq!(ack.payload, b"hello");

        assert_eq!(fs.status(file).unwrap().size, 5);
    }

    #[test]
    fn create_existing_file_fails() {
        let (_tmp, mut fs) = store();
        let root = fs.dir("/", false).unwrap();
        fs.file(root, "data", Mode::ReadWrite, true).unwrap();
        assert_eq!(
            fs.file(root, "data", Mode::ReadWrite, true),
            Err(FsError::NodeAlreadyExists)
        );
    }

    #[test]
    fn read_only_write_refused() {
        let (_tmp, mut fs) = store();
        let root = fs.dir("/", false).unwrap();
        let h = fs.file(root, "data", Mode::ReadWrite, true).unwrap();
        fs.close(h);
        let h = fs.file(root, "data", Mode::ReadOnly, false).unwrap();
        fs.submit(Packet::write(h, 0, b"x".to_vec()));
        assert!(!fs.next_ack().unwrap().succeeded);
    }

    #[test]
    fn symlink_roundtrip() {
        let (_tmp, mut fs) = store();
        let root = fs.dir("/", false).unwrap();
        let link = fs.symlink(root, "current", true).unwrap();
        fs.submit(Packet::write(link, 0, b"target-name".to_vec()));
        assert!(fs.next_ack().unwrap().succeeded);

        fs.submit(Packet::read(link, 0, 64));
        let ack = fs.next_ack().unwrap();
        assert!(ack.succeeded);
        assert_eq!(ack.payload, b"target-name");
        assert_eq!(fs.status(link).unwrap().kind, NodeKind::Symlink);
    }

    #[test]
    fn directory_listing_is_sorted() {
        let (_tmp, mut fs) = store();
        let root = fs.dir("/", false).unwrap();
        for name in ["zeta", "alpha", "mid"] {
            fs.file(root, name, Mode::WriteOnly, true).unwrap();
        }
        fs.submit(Packet::read(root, 0, 3 * DIRENT_SIZE));
        let ack = fs.next_ack().unwrap();
        assert!(ack.succeeded);
        let names: Vec<String> = ack
            .payload
            .chunks(DIRENT_SIZE)
            .map(|c| DirEntry::decode(c).unwrap().name)
            .collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
    }

    #[test]
    fn unlink_and_not_empty() {
        let (_tmp, mut fs) = store();
        let root = fs.dir("/", false).unwrap();
        fs.dir("/sub", true).unwrap();
        let sub = fs.dir("/sub", false).unwrap();
        fs.file(sub, "inner", Mode::WriteOnly, true).unwrap();

        assert_eq!(fs.unlink(root, "sub"), Err(FsError::NotEmpty));
        fs.unlink(sub, "inner").unwrap();
        fs.unlink(root, "sub").unwrap();
        assert_eq!(fs.node("/sub"), Err(FsError::LookupFailed));
    }

    #[test]
    fn rename_moves_nodes() {
        let (_tmp, mut fs) = store();
        let root = fs.dir("/", false).unwrap();
        fs.file(root, "before", Mode::WriteOnly, true).unwrap();
        fs.rename(root, "before", root, "after").unwrap();
        assert!(fs.node("/after").is_ok());
        assert_eq!(fs.node("/before"), Err(FsError::LookupFailed));
    }

    #[test]
    fn dotdot_is_rejected() {
        let (_tmp, mut fs) = store();
        assert_eq!(fs.node("/../etc"), Err(FsError::LookupFailed));
        assert_eq!(fs.dir("/a/../b", true), Err(FsError::LookupFailed));
    }

    #[test]
    fn read_only_session_refuses_mutation() {
        let (tmp, mut rw) = store();
        let root = rw.dir("/", false).unwrap();
        rw.file(root, "data", Mode::WriteOnly, true).unwrap();

        let mut ro = LocalStore::open_read_only(tmp.path()).unwrap();
        let root = ro.dir("/", false).unwrap();
        assert_eq!(ro.dir("/new", true), Err(FsError::PermissionDenied));
        assert_eq!(
            ro.file(root, "data", Mode::ReadWrite, false),
            Err(FsError::PermissionDenied)
        );
        assert_eq!(ro.unlink(root, "data"), Err(FsError::PermissionDenied));
        assert!(ro.file(root, "data", Mode::ReadOnly, false).is_ok());
    }

    #[test]
    fn bad_handle() {
        let (_tmp, mut fs) = store();
        assert_eq!(fs.status(Handle(42)), Err(FsError::InvalidHandle));
    }
}
