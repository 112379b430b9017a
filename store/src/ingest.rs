//! The ingest session: a hashing proxy in front of the store
//! filesystem.
//!
//! Clients write ordinary files and directories through this session.
//! Every top-level element becomes a *hash root* with a random
//! `ingest-<nonce>` name on the backend; all traffic beneath it is
//! mirrored into a hash tree. Creating a symlink at the top level (or
//! calling [`IngestSession::ingest`]) finalizes the root: the tree is
//! flushed, the digest is encoded into the content-addressed name, and
//! the backend node is renamed into place. Reading the virtual symlink
//! afterwards yields the final name.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, error, warn};

use nichts_compat::store_name;

use crate::errors::FsError;
use crate::session::{
    split_first_element, Control, FsSession, Handle, Mode, Notifier, Packet, PacketOp, Status,
    TX_QUEUE_SIZE,
};
use crate::tree::{DirectoryNode, FileNode, Node};
use crate::util;

/// Open backend handles mapped to hash nodes, per session.
pub const MAX_NODE_HANDLES: usize = 128;

/// Concurrent hash roots per session.
pub const MAX_ROOT_NODES: usize = 64;

/// Virtual root-symlink handles carry this bit.
pub const ROOT_HANDLE_PREFIX: u32 = 1 << 31;

const ROOT_HANDLE_MASK: u32 = (MAX_ROOT_NODES - 1) as u32;

/// Metadata cost accounted per hash node.
const NODE_COST: usize = 256;

struct HashRoot {
    /// Client-visible name of the root.
    name: String,
    /// Backend name: `ingest-<nonce>` until done, the final
    /// content-addressed name afterwards.
    filename: String,
    node: Node,
    done: bool,
}

/// A backend handle mapped into the hash tree: the root slot, and the
/// node's path below the root node (empty for the root node itself).
struct Registered {
    root: usize,
    path: Vec<String>,
}

fn fresh_nonce() -> u64 {
    let mut buf = [0u8; 8];
    // getrandom only fails on broken platforms
    getrandom::getrandom(&mut buf).expect("no entropy source");
    u64::from_le_bytes(buf)
}

pub struct IngestSession {
    backend: Box<dyn FsSession>,
    root_handle: Handle,
    roots: Vec<Option<HashRoot>>,
    registry: HashMap<u32, Registered>,
    /// Client packets awaiting a backend acknowledgement.
    queue: Vec<Option<Packet>>,
    client_acks: VecDeque<Packet>,
    /// Pre-declared root names; non-empty means strict mode.
    expected: HashSet<String>,
    revoked: bool,
    meta_quota: usize,
    meta_used: usize,
}

impl IngestSession {
    pub fn new(mut backend: Box<dyn FsSession>) -> Result<Self, FsError> {
        let root_handle = backend.dir("/", false)?;
        Ok(IngestSession {
            backend,
            root_handle,
            roots: Vec::new(),
            registry: HashMap::new(),
            queue: (0..TX_QUEUE_SIZE).map(|_| None).collect(),
            client_acks: VecDeque::new(),
            expected: HashSet::new(),
            revoked: false,
            meta_quota: 64 * 1024,
            meta_used: 0,
        })
    }

    /// Donate metadata quota to the session.
    pub fn upgrade(&mut self, bytes: usize) {
        self.meta_quota += bytes;
    }

    /// Pre-declare an expected root name. Once any name is declared the
    /// session refuses to create roots outside the declared set.
    pub fn expect(&mut self, name: &str) {
        self.expected.insert(name.to_string());
    }

    /// Hand out the client-facing filesystem session.
    pub fn file_system_session(&mut self) -> &mut dyn FsSession {
        self
    }

    /// Revoke the client-facing session; all further operations fail.
    pub fn revoke_session(&mut self) {
        self.revoked = true;
    }

    /// Finalize root `name` and return its content-addressed name.
    pub fn ingest(&mut self, name: &str) -> Result<String, FsError> {
        let index = self.find_root(name).ok_or(FsError::LookupFailed)?;
        if !self.root(index)?.done {
            self.finish(index)?;
        }
        Ok(self.root(index)?.filename.clone())
    }

    /// The final name of a finished root.
    pub fn final_name(&self, name: &str) -> Option<&str> {
        self.roots.iter().flatten().find_map(|root| {
            (root.name == name && root.done).then_some(root.filename.as_str())
        })
    }

    fn check_revoked(&self) -> Result<(), FsError> {
        if self.revoked {
            Err(FsError::PermissionDenied)
        } else {
            Ok(())
        }
    }

    fn charge_meta(&mut self) -> Result<(), FsError> {
        if self.meta_quota - self.meta_used < NODE_COST {
            return Err(FsError::NoSpace);
        }
        self.meta_used += NODE_COST;
        Ok(())
    }

    fn find_root(&self, name: &str) -> Option<usize> {
        self.roots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|root| root.name == name))
    }

    fn root(&self, index: usize) -> Result<&HashRoot, FsError> {
        self.roots
            .get(index)
            .and_then(|slot| slot.as_ref())
            .ok_or(FsError::InvalidHandle)
    }

    fn root_mut(&mut self, index: usize) -> Result<&mut HashRoot, FsError> {
        self.roots
            .get_mut(index)
            .and_then(|slot| slot.as_mut())
            .ok_or(FsError::InvalidHandle)
    }

    /// Allocate a hash root for `name`, enforcing strict mode.
    fn alloc_root(&mut self, name: &str, node: Node) -> Result<usize, FsError> {
        if !self.expected.is_empty() && !self.expected.contains(name) {
            warn!(name, "refusing undeclared ingest root");
            return Err(FsError::PermissionDenied);
        }
        self.charge_meta()?;
        let root = HashRoot {
            name: name.to_string(),
            filename: format!("ingest-{}", fresh_nonce()),
            node,
            done: false,
        };
        for (i, slot) in self.roots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(root);
                return Ok(i);
            }
        }
        if self.roots.len() >= MAX_ROOT_NODES {
            return Err(FsError::OutOfNodeHandles);
        }
        self.roots.push(Some(root));
        Ok(self.roots.len() - 1)
    }

    fn virtual_handle(index: usize) -> Handle {
        Handle(index as u32 | ROOT_HANDLE_PREFIX)
    }

    fn register(&mut self, handle: Handle, entry: Registered) -> Result<(), FsError> {
        if self.registry.len() >= MAX_NODE_HANDLES {
            self.backend.close(handle);
            return Err(FsError::OutOfNodeHandles);
        }
        self.registry.insert(handle.0, entry);
        Ok(())
    }

    fn registered_node(&mut self, handle: Handle) -> Option<&mut Node> {
        let entry = self.registry.get(&handle.0)?;
        let root = self.roots.get_mut(entry.root)?.as_mut()?;
        if entry.path.is_empty() {
            return Some(&mut root.node);
        }
        match &mut root.node {
            Node::Directory(dir) => dir.lookup_path(&entry.path),
            _ => None,
        }
    }

    /// Create a backend node at the root, replacing leftovers from an
    /// earlier aborted ingest of the same temporary name.
    fn backend_create_root_dir(&mut self, filename: &str, create: bool) -> Result<Handle, FsError> {
        let path = format!("/{filename}");
        match self.backend.dir(&path, create) {
            Err(FsError::NodeAlreadyExists) => {
                self.backend_unlink_root(filename)?;
                self.backend.dir(&path, true)
            }
            other => other,
        }
    }

    fn backend_create_root_file(
        &mut self,
        filename: &str,
        mode: Mode,
        create: bool,
    ) -> Result<Handle, FsError> {
        match self.backend.file(self.root_handle, filename, mode, create) {
            Err(FsError::NodeAlreadyExists) => {
                self.backend_unlink_root(filename)?;
                self.backend.file(self.root_handle, filename, mode, true)
            }
            other => other,
        }
    }

    /// Unlink a top-level backend node, emptying it first if necessary.
    fn backend_unlink_root(&mut self, filename: &str) -> Result<(), FsError> {
        match self.backend.unlink(self.root_handle, filename) {
            Err(FsError::NotEmpty) => {
                util::empty_dir(self.backend.as_mut(), &format!("/{filename}"))?;
                self.backend.unlink(self.root_handle, filename)
            }
            other => other,
        }
    }

    /// Flush, name and atomically publish root `index`.
    fn finish(&mut self, index: usize) -> Result<(), FsError> {
        // close handles first so all writes are settled
        for (value, _) in self.registry.drain() {
            self.backend.close(Handle(value));
        }

        let root_handle = self.root_handle;
        let (filename, name) = {
            let root = self.root(index)?;
            (root.filename.clone(), root.name.clone())
        };

        let backend = self.backend.as_mut();
        let mut digest = [0u8; crate::tree::DIGEST_SIZE];
        {
            let root = self
                .roots
                .get_mut(index)
                .and_then(|slot| slot.as_mut())
                .ok_or(FsError::InvalidHandle)?;
            match &mut root.node {
                Node::File(file) => {
                    let handle = backend.file(root_handle, &filename, Mode::ReadOnly, false)?;
                    let flushed = file.flush(backend, handle);
                    backend.close(handle);
                    flushed?;
                }
                Node::Directory(dir) => {
                    dir.flush(backend, &format!("/{filename}"))?;
                }
                Node::Symlink(_) => return Err(FsError::InvalidHandle),
            }
            root.node.digest(&mut digest);
        }

        let final_name = store_name::encode(&digest, &name);
        if final_name.len() > store_name::MAX_NAME_LEN {
            return Err(FsError::NameTooLong);
        }

        match self.backend.node(&format!("/{final_name}")) {
            Ok(handle) => {
                // same content was ingested before; keep the existing
                // object and drop the temporary tree
                self.backend.close(handle);
                debug!(%final_name, "ingest subsumed by existing object");
                self.backend_unlink_root(&filename)?;
            }
            Err(FsError::LookupFailed) => {
                self.backend
                    .rename(root_handle, &filename, root_handle, &final_name)?;
            }
            Err(e) => return Err(e),
        }

        let root = self.root_mut(index)?;
        root.filename = final_name;
        root.done = true;
        Ok(())
    }

    /// Queue a client packet for the backend, or acknowledge it locally.
    fn process_incoming(&mut self, mut packet: Packet) {
        packet.succeeded = false;

        // reading the entries of the root is not allowed
        if packet.length == 0 || packet.handle == self.root_handle {
            self.client_acks.push_back(packet);
            return;
        }

        if packet.handle.0 & ROOT_HANDLE_PREFIX != 0 {
            // emulate the read of a virtual symlink
            let index = (packet.handle.0 & ROOT_HANDLE_MASK) as usize;
            if let Ok(root) = self.root(index) {
                if root.done && packet.op == PacketOp::Read {
                    let name = root.filename.as_bytes();
                    if name.len() <= packet.length {
                        packet.payload = name.to_vec();
                        packet.length = name.len();
                        packet.succeeded = true;
                    }
                }
            }
            self.client_acks.push_back(packet);
            return;
        }

        if packet.op == PacketOp::Write && !self.registry.contains_key(&packet.handle.0) {
            // if we do not hash it, they do not write it
            error!(handle = packet.handle.0, "write without a hash node");
            self.client_acks.push_back(packet);
            return;
        }

        let slot = match self.queue.iter().position(|s| s.is_none()) {
            Some(slot) => slot,
            None => {
                self.client_acks.push_back(packet);
                return;
            }
        };

        let mut ours = packet.clone();
        ours.succeeded = false;
        self.queue[slot] = Some(packet);
        self.backend.submit(ours);
    }

    /// Match backend acknowledgements back to queued client packets.
    ///
    /// Write payloads are hashed only now, from the backend's echo: the
    /// client's buffer is untrusted and may change after submission,
    /// so only bytes confirmed committed to storage are absorbed.
    fn process_outgoing(&mut self) {
        while let Some(ours) = self.backend.next_ack() {
            let slot = match self
                .queue
                .iter()
                .position(|s| s.as_ref().is_some_and(|p| p.matches(&ours)))
            {
                Some(slot) => slot,
                None => {
                    // this is bad, there is probably a stuck packet now
                    error!("unknown packet received from the backend");
                    continue;
                }
            };
            let mut theirs = self.queue[slot].take().expect("matched slot is full");

            let mut length = ours.length;
            match ours.op {
                PacketOp::Write => {
                    if ours.succeeded {
                        match self.registered_node(ours.handle) {
                            Some(node) => node.write(&ours.payload, ours.position),
                            None => length = 0,
                        }
                    } else {
                        length = 0;
                    }
                }
                PacketOp::Read => {
                    theirs.payload = ours.payload;
                }
            }
            theirs.length = length;
            theirs.succeeded = length > 0;
            self.client_acks.push_back(theirs);
        }
    }
}

impl FsSession for IngestSession {
    fn dir(&mut self, path: &str, create: bool) -> Result<Handle, FsError> {
        self.check_revoked()?;

        if path == "/" || path.is_empty() {
            return if create {
                Err(FsError::NodeAlreadyExists)
            } else {
                Ok(self.root_handle)
            };
        }

        let (name, rest) = split_first_element(path);
        if name.is_empty() {
            return Err(FsError::LookupFailed);
        }

        let index = match self.find_root(name) {
            Some(index) => {
                if !matches!(self.root(index)?.node, Node::Directory(_)) {
                    return Err(FsError::LookupFailed);
                }
                index
            }
            None => {
                if !create || !rest.is_empty() {
                    return Err(FsError::LookupFailed);
                }
                self.alloc_root(name, Node::Directory(DirectoryNode::new(name)))?
            }
        };

        let filename = self.root(index)?.filename.clone();

        if rest.is_empty() {
            let handle = self.backend_create_root_dir(&filename, create)?;
            self.register(handle, Registered { root: index, path: vec![] })?;
            return Ok(handle);
        }

        // rewrite the path below the temporary backend name
        if create {
            self.charge_meta()?;
        }
        let handle = self.backend.dir(&format!("/{filename}/{rest}"), create)?;
        {
            let root = self.root_mut(index)?;
            match &mut root.node {
                Node::Directory(dir) => {
                    dir.dir(rest, create)?;
                }
                _ => return Err(FsError::LookupFailed),
            }
        }
        let path_elements = rest.split('/').map(str::to_string).collect();
        self.register(handle, Registered { root: index, path: path_elements })?;
        Ok(handle)
    }

    fn file(
        &mut self,
        dir: Handle,
        name: &str,
        mode: Mode,
        create: bool,
    ) -> Result<Handle, FsError> {
        self.check_revoked()?;

        if dir == self.root_handle {
            let index = match self.find_root(name) {
                Some(index) => {
                    if !matches!(self.root(index)?.node, Node::File(_)) {
                        return Err(FsError::LookupFailed);
                    }
                    index
                }
                None => {
                    if !create {
                        return Err(FsError::LookupFailed);
                    }
                    self.alloc_root(name, Node::File(FileNode::new(name)))?
                }
            };
            let filename = self.root(index)?.filename.clone();
            let handle = self.backend_create_root_file(&filename, mode, create)?;
            if mode.writeable() {
                self.register(handle, Registered { root: index, path: vec![] })?;
            }
            return Ok(handle);
        }

        if create {
            self.charge_meta()?;
        }
        let handle = self.backend.file(dir, name, mode, create)?;

        // a handle that cannot modify data is not our concern
        if !mode.writeable() {
            return Ok(handle);
        }

        let parent = self.registry.get(&dir.0).ok_or(FsError::InvalidHandle)?;
        let root = parent.root;
        let mut path = parent.path.clone();
        {
            let parent_node = self.registered_node(dir).ok_or(FsError::InvalidHandle)?;
            match parent_node {
                Node::Directory(dir_node) => {
                    dir_node.file(name, create)?;
                }
                _ => return Err(FsError::InvalidHandle),
            }
        }
        path.push(name.to_string());
        self.register(handle, Registered { root, path })?;
        Ok(handle)
    }

    fn symlink(&mut self, dir: Handle, name: &str, create: bool) -> Result<Handle, FsError> {
        self.check_revoked()?;

        if dir != self.root_handle {
            if create {
                self.charge_meta()?;
            }
            let handle = self.backend.symlink(dir, name, create)?;
            let parent = self.registry.get(&dir.0).ok_or(FsError::InvalidHandle)?;
            let root = parent.root;
            let mut path = parent.path.clone();
            {
                let parent_node = self.registered_node(dir).ok_or(FsError::InvalidHandle)?;
                match parent_node {
                    Node::Directory(dir_node) => {
                        dir_node.symlink(name, create)?;
                    }
                    _ => return Err(FsError::InvalidHandle),
                }
            }
            path.push(name.to_string());
            self.register(handle, Registered { root, path })?;
            return Ok(handle);
        }

        // a symlink at the session root finalizes the matching hash
        // root; the client learns the final name by reading it back
        let index = self.find_root(name).ok_or(FsError::LookupFailed)?;
        if create {
            if !self.root(index)?.done {
                self.finish(index)?;
            }
        } else if !self.root(index)?.done {
            return Err(FsError::LookupFailed);
        }
        Ok(Self::virtual_handle(index))
    }

    fn node(&mut self, path: &str) -> Result<Handle, FsError> {
        self.check_revoked()?;

        if path == "/" || path.is_empty() {
            return Ok(self.root_handle);
        }
        let (name, rest) = split_first_element(path);
        let index = self.find_root(name).ok_or(FsError::LookupFailed)?;
        let root = self.root(index)?;

        // once done, the root is observed as a symlink
        if root.done {
            return Ok(Self::virtual_handle(index));
        }

        let rewritten = if rest.is_empty() {
            format!("/{}", root.filename)
        } else {
            format!("/{}/{}", root.filename, rest)
        };
        self.backend.node(&rewritten)
    }

    fn status(&mut self, handle: Handle) -> Result<Status, FsError> {
        self.check_revoked()?;

        if handle.0 & ROOT_HANDLE_PREFIX != 0 {
            let root = self.root((handle.0 & ROOT_HANDLE_MASK) as usize)?;
            return Ok(Status {
                size: root.filename.len() as u64,
                kind: crate::session::NodeKind::Symlink,
            });
        }
        if handle == self.root_handle {
            // a zero size stops clients from enumerating the root
            let mut status = self.backend.status(handle)?;
            status.size = 0;
            return Ok(status);
        }
        self.backend.status(handle)
    }

    fn close(&mut self, handle: Handle) {
        if handle == self.root_handle || handle.0 & ROOT_HANDLE_PREFIX != 0 {
            return;
        }
        self.backend.close(handle);
        self.registry.remove(&handle.0);
    }

    fn unlink(&mut self, dir: Handle, name: &str) -> Result<(), FsError> {
        self.check_revoked()?;

        if dir == self.root_handle {
            let index = self.find_root(name).ok_or(FsError::LookupFailed)?;
            let filename = self.root(index)?.filename.clone();
            self.backend_unlink_root(&filename)?;
            self.roots[index] = None;
            return Ok(());
        }

        self.backend.unlink(dir, name)?;
        if let Some(Node::Directory(dir_node)) = self.registered_node(dir) {
            dir_node.remove(name);
        }
        Ok(())
    }

    fn truncate(&mut self, handle: Handle, len: u64) -> Result<(), FsError> {
        self.check_revoked()?;

        match self.registered_node(handle) {
            Some(Node::File(_)) => (),
            _ => return Err(FsError::InvalidHandle),
        }
        self.backend.truncate(handle, len)?;
        if let Some(Node::File(file)) = self.registered_node(handle) {
            file.truncate(len);
        }
        Ok(())
    }

    fn rename(
        &mut self,
        _from_dir: Handle,
        _from_name: &str,
        _to_dir: Handle,
        _to_name: &str,
    ) -> Result<(), FsError> {
        // TODO: needs node re-insertion under the new name in the tree
        Err(FsError::PermissionDenied)
    }

    fn sigh(&mut self, handle: Handle, notifier: Notifier) -> Result<(), FsError> {
        self.check_revoked()?;
        if handle == self.root_handle || handle.0 & ROOT_HANDLE_PREFIX != 0 {
            return Err(FsError::InvalidHandle);
        }
        self.backend.sigh(handle, notifier)
    }

    fn control(&mut self, handle: Handle, op: Control) -> Result<(), FsError> {
        self.check_revoked()?;
        if handle.0 & ROOT_HANDLE_PREFIX != 0 {
            return Err(FsError::InvalidHandle);
        }
        self.backend.control(handle, op)
    }

    fn submit(&mut self, packet: Packet) {
        if self.revoked {
            let mut packet = packet;
            packet.succeeded = false;
            self.client_acks.push_back(packet);
            return;
        }
        self.process_incoming(packet);
        self.process_outgoing();
    }

    fn next_ack(&mut self) -> Option<Packet> {
        self.client_acks.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalStore;
    use crate::session::NodeKind;
    use tempfile::TempDir;

    fn session(tmp: &TempDir) -> IngestSession {
        let backend = LocalStore::open(tmp.path()).unwrap();
        IngestSession::new(Box::new(backend)).unwrap()
    }

    fn write_all(fs: &mut IngestSession, handle: Handle, data: &[u8]) {
        fs.submit(Packet::write(handle, 0, data.to_vec()));
        let ack = fs.next_ack().unwrap();
        assert!(ack.succeeded, "write must succeed");
    }

    fn finalize(fs: &mut IngestSession, name: &str) -> String {
        let root = fs.dir("/", false).unwrap();
        let link = fs.symlink(root, name, true).unwrap();
        fs.submit(Packet::read(link, 0, 128));
        let ack = fs.next_ack().unwrap();
        assert!(ack.succeeded, "virtual symlink read must succeed");
        String::from_utf8(ack.payload).unwrap()
    }

    #[test]
    fn single_file_ingest_yields_content_address() {
        let tmp = TempDir::new().unwrap();
        let mut fs = session(&tmp);

        let root = fs.dir("/", false).unwrap();
        let out = fs.file(root, "out", Mode::ReadWrite, true).unwrap();
        write_all(&mut fs, out, b"hello");
        fs.close(out);

        let final_name = finalize(&mut fs, "out");
        assert_eq!(final_name, "bpvli1d2ds8w4v209ka0bf12qhqpxrdw-out");
        nichts_compat::StoreName::parse(&final_name).expect("final names are store names");

        // the object is on disk under its final name
        assert_eq!(
            std::fs::read(tmp.path().join(&final_name)).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn identical_ingests_collide_to_one_object() {
        let tmp = TempDir::new().unwrap();

        let first = {
            let mut fs = session(&tmp);
            let root = fs.dir("/", false).unwrap();
            let out = fs.file(root, "out", Mode::ReadWrite, true).unwrap();
            write_all(&mut fs, out, b"hello");
            finalize(&mut fs, "out")
        };
        let second = {
            let mut fs = session(&tmp);
            let root = fs.dir("/", false).unwrap();
            let out = fs.file(root, "out", Mode::ReadWrite, true).unwrap();
            write_all(&mut fs, out, b"hello");
            finalize(&mut fs, "out")
        };
        assert_eq!(first, second);

        // no temporary leftovers
        let residue: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("ingest-"))
            .collect();
        assert!(residue.is_empty(), "stale ingest temps: {residue:?}");
    }

    #[test]
    fn directory_tree_ingest() {
        let tmp = TempDir::new().unwrap();
        let mut fs = session(&tmp);

        fs.dir("/mydir", true).unwrap();
        let sub = fs.dir("/mydir", false).unwrap();
        let f = fs.file(sub, "a.txt", Mode::ReadWrite, true).unwrap();
        write_all(&mut fs, f, b"AAA");
        fs.close(f);
        let l = fs.symlink(sub, "l", true).unwrap();
        write_all(&mut fs, l, b"a.txt");
        fs.close(l);

        let final_name = finalize(&mut fs, "mydir");
        assert_eq!(final_name, "120z70k8j5j66xwy365ibqa0j7fdp8la-mydir");

        assert_eq!(
            std::fs::read(tmp.path().join(&final_name).join("a.txt")).unwrap(),
            b"AAA"
        );
        let target = std::fs::read_link(tmp.path().join(&final_name).join("l")).unwrap();
        assert_eq!(target.to_str().unwrap(), "a.txt");
    }

    #[test]
    fn virtual_symlink_atomicity() {
        let tmp = TempDir::new().unwrap();
        let mut fs = session(&tmp);

        let root = fs.dir("/", false).unwrap();
        let out = fs.file(root, "out", Mode::ReadWrite, true).unwrap();
        write_all(&mut fs, out, b"hello");

        // before finalization the node resolves to the temporary name
        let node = fs.node("/out").unwrap();
        assert_eq!(fs.status(node).unwrap().kind, NodeKind::File);
        fs.close(node);
        fs.close(out);

        finalize(&mut fs, "out");

        // afterwards it is a symlink to the final name
        let node = fs.node("/out").unwrap();
        let status = fs.status(node).unwrap();
        assert_eq!(status.kind, NodeKind::Symlink);
        assert_eq!(status.size as usize, "bpvli1d2ds8w4v209ka0bf12qhqpxrdw-out".len());
    }

    #[test]
    fn root_is_concealed() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("secret"), b"hidden").unwrap();
        let mut fs = session(&tmp);

        let root = fs.dir("/", false).unwrap();
        assert_eq!(fs.status(root).unwrap().size, 0);

        // reading the root is refused
        fs.submit(Packet::read(root, 0, 512));
        assert!(!fs.next_ack().unwrap().succeeded);

        // and creating it is too
        assert_eq!(fs.dir("/", true), Err(FsError::NodeAlreadyExists));
    }

    #[test]
    fn reads_of_unrelated_objects_are_refused() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("secret"), b"hidden").unwrap();
        let mut fs = session(&tmp);
        assert_eq!(fs.node("/secret"), Err(FsError::LookupFailed));
    }

    #[test]
    fn strict_mode_rejects_undeclared_roots() {
        let tmp = TempDir::new().unwrap();
        let mut fs = session(&tmp);
        fs.expect("out");

        let root = fs.dir("/", false).unwrap();
        assert!(fs.file(root, "out", Mode::ReadWrite, true).is_ok());
        assert_eq!(
            fs.file(root, "rogue", Mode::ReadWrite, true),
            Err(FsError::PermissionDenied)
        );
        assert_eq!(fs.dir("/rogue", true), Err(FsError::PermissionDenied));
    }

    #[test]
    fn ingest_rpc_finalizes() {
        let tmp = TempDir::new().unwrap();
        let mut fs = session(&tmp);

        let root = fs.dir("/", false).unwrap();
        let out = fs.file(root, "out", Mode::ReadWrite, true).unwrap();
        write_all(&mut fs, out, b"hello");
        fs.close(out);

        let final_name = fs.ingest("out").unwrap();
        assert_eq!(final_name, "bpvli1d2ds8w4v209ka0bf12qhqpxrdw-out");
        // idempotent
        assert_eq!(fs.ingest("out").unwrap(), final_name);
        assert_eq!(fs.ingest("absent"), Err(FsError::LookupFailed));
        assert_eq!(fs.final_name("out"), Some(final_name.as_str()));
    }

    #[test]
    fn empty_file_root() {
        let tmp = TempDir::new().unwrap();
        let mut fs = session(&tmp);

        let root = fs.dir("/", false).unwrap();
        let h = fs.file(root, "empty", Mode::ReadWrite, true).unwrap();
        fs.close(h);

        let final_name = fs.ingest("empty").unwrap();
        assert_eq!(final_name, "zzwvjddz9j98vfh46c3h0cjvrkiq3jd8-empty");
    }

    #[test]
    fn root_limit() {
        let tmp = TempDir::new().unwrap();
        let mut fs = session(&tmp);
        fs.upgrade(1 << 20);
        let root = fs.dir("/", false).unwrap();

        for i in 0..MAX_ROOT_NODES {
            let h = fs.file(root, &format!("r{i}"), Mode::WriteOnly, true).unwrap();
            fs.close(h);
        }
        assert_eq!(
            fs.file(root, "straw", Mode::WriteOnly, true),
            Err(FsError::OutOfNodeHandles)
        );
    }

    #[test]
    fn revoked_session_refuses_everything() {
        let tmp = TempDir::new().unwrap();
        let mut fs = session(&tmp);
        let root = fs.dir("/", false).unwrap();
        fs.revoke_session();

        assert_eq!(fs.dir("/x", true), Err(FsError::PermissionDenied));
        assert_eq!(
            fs.file(root, "x", Mode::WriteOnly, true),
            Err(FsError::PermissionDenied)
        );
        fs.submit(Packet::read(root, 0, 8));
        assert!(!fs.next_ack().unwrap().succeeded);
    }

    #[test]
    fn unfinished_root_symlink_read_fails() {
        let tmp = TempDir::new().unwrap();
        let mut fs = session(&tmp);
        let root = fs.dir("/", false).unwrap();
        let out = fs.file(root, "out", Mode::WriteOnly, true).unwrap();
        fs.close(out);

        // reading the root symlink before finalization is a lookup error
        assert_eq!(fs.symlink(root, "out", false), Err(FsError::LookupFailed));
    }

    #[test]
    fn truncate_restarts_the_stream() {
        let tmp = TempDir::new().unwrap();
        let mut fs = session(&tmp);
        let root = fs.dir("/", false).unwrap();
        let out = fs.file(root, "out", Mode::ReadWrite, true).unwrap();

        write_all(&mut fs, out, b"scratch this");
        fs.truncate(out, 0).unwrap();
        write_all(&mut fs, out, b"hello");
        fs.close(out);

        assert_eq!(fs.ingest("out").unwrap(), "bpvli1d2ds8w4v209ka0bf12qhqpxrdw-out");
    }

    #[test]
    fn streamed_writes_hash_in_commit_order() {
        let tmp = TempDir::new().unwrap();
        let mut fs = session(&tmp);
        let root = fs.dir("/", false).unwrap();
        let out = fs.file(root, "out", Mode::ReadWrite, true).unwrap();

        fs.submit(Packet::write(out, 0, b"hel".to_vec()));
        fs.submit(Packet::write(out, 3, b"lo".to_vec()));
        assert!(fs.next_ack().unwrap().succeeded);
        assert!(fs.next_ack().unwrap().succeeded);
        fs.close(out);

        assert_eq!(fs.ingest("out").unwrap(), "bpvli1d2ds8w4v209ka0bf12qhqpxrdw-out");
    }
}
