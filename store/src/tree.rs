//! The in-memory hash tree maintained by an ingest session.
//!
//! Every node accumulates a streaming BLAKE2s digest of its content.
//! On finalization the tree is flushed depth first: files absorb any
//! bytes that bypassed the session (read back through the backend),
//! then every node absorbs a framing tag and its own name, and
//! directories absorb the digests of their children in name order. The
//! resulting root digest is deterministic over content, structure and
//! names.

use nichts_compat::hash::{Blake2s, HashFunction};

use crate::errors::FsError;
use crate::session::{FsSession, Handle, Mode, Packet};

/// Digest length of the tree hash.
pub const DIGEST_SIZE: usize = 32;

const FILE_FRAMING: &[u8] = b"\0f\0";
const SYMLINK_FRAMING: &[u8] = b"\0s\0";
const DIRECTORY_FRAMING: &[u8] = b"\0d\0";

/// Read-back chunk, aligned to the hash block size.
const FLUSH_CHUNK: usize = 4096;

#[derive(Clone)]
pub struct FileNode {
    name: String,
    hash: Blake2s,
    /// Position up to which content has been absorbed.
    cursor: u64,
}

impl FileNode {
    pub fn new(name: &str) -> Self {
        FileNode {
            name: name.to_string(),
            hash: Blake2s::new(),
            cursor: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Absorb `data` if it continues the stream.
    ///
    /// A write before the cursor restarts the hash (the flush read-back
    /// recovers the authoritative content); a write past the cursor is
    /// dropped, as sparse streams cannot be hashed incrementally.
    pub fn write(&mut self, data: &[u8], offset: u64) {
        if offset > self.cursor {
            return;
        }
        if offset < self.cursor {
            self.cursor = 0;
            self.hash.reset();
        }
        self.hash.update(data);
        self.cursor += data.len() as u64;
    }

    pub fn truncate(&mut self, size: u64) {
        if size < self.cursor {
            self.cursor = 0;
            self.hash.reset();
        }
    }

    /// Absorb any tail the session did not see, then the framing.
    pub fn flush(&mut self, fs: &mut dyn FsSession, handle: Handle) -> Result<(), FsError> {
        let size = fs.status(handle)?.size;

        if size != self.cursor {
            let block = self.hash.block_size();
            let chunk = (FLUSH_CHUNK / block) * block;

            // a short first read re-aligns the stream to the chunk size
            let mut n = (self.cursor % chunk as u64) as usize;
            if n == 0 {
                n = chunk;
            }

            while self.cursor < size {
                fs.submit(Packet::read(handle, self.cursor, n));
                let ack = fs.next_ack().ok_or(FsError::InvalidHandle)?;
                if !ack.succeeded || ack.length == 0 {
                    tracing::error!(name = %self.name, "read back of node failed");
                    return Err(FsError::LookupFailed);
                }
                self.hash.update(&ack.payload);
                self.cursor += ack.length as u64;
                n = ((size - self.cursor) as usize).min(chunk);
            }
        }

        self.hash.update(FILE_FRAMING);
        self.hash.update(self.name.as_bytes());
        self.cursor = 0;
        Ok(())
    }

    pub fn digest(&mut self, out: &mut [u8]) {
        self.hash.digest(out);
    }
}

#[derive(Clone)]
pub struct SymlinkNode {
    name: String,
    hash: Blake2s,
}

impl SymlinkNode {
    pub fn new(name: &str) -> Self {
        SymlinkNode {
            name: name.to_string(),
            hash: Blake2s::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Absorb the symlink target. Only whole-target writes at offset
    /// zero are meaningful; others are dropped.
    pub fn write(&mut self, data: &[u8], offset: u64) {
        if offset != 0 {
            return;
        }
        self.hash.reset();
        self.hash.update(data);
    }

    pub fn flush(&mut self) {
        self.hash.update(SYMLINK_FRAMING);
        self.hash.update(self.name.as_bytes());
    }

    pub fn digest(&mut self, out: &mut [u8]) {
        self.hash.digest(out);
    }
}

#[derive(Clone)]
pub struct DirectoryNode {
    name: String,
    hash: Blake2s,
    /// Children in strict byte order of their names.
    children: Vec<Node>,
}

impl DirectoryNode {
    pub fn new(name: &str) -> Self {
        DirectoryNode {
            name: name.to_string(),
            hash: Blake2s::new(),
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert preserving name order; an existing child of the same name
    /// is replaced.
    fn insert(&mut self, node: Node) -> &mut Node {
        match self
            .children
            .binary_search_by(|c| c.name().cmp(node.name()))
        {
            Ok(at) => {
                self.children[at] = node;
                &mut self.children[at]
            }
            Err(at) => {
                self.children.insert(at, node);
                &mut self.children[at]
            }
        }
    }

    fn child_mut(&mut self, name: &str) -> Option<&mut Node> {
        match self.children.binary_search_by(|c| c.name().cmp(name)) {
            Ok(at) => Some(&mut self.children[at]),
            Err(_) => None,
        }
    }

    /// Resolve the node at `path` below this directory.
    pub(crate) fn lookup_path(&mut self, path: &[String]) -> Option<&mut Node> {
        let (name, rest) = path.split_first()?;
        let child = self.child_mut(name)?;
        if rest.is_empty() {
            return Some(child);
        }
        match child {
            Node::Directory(dir) => dir.lookup_path(rest),
            _ => None,
        }
    }

    /// Walk (or create) the directory at `path` below this one.
    pub fn dir(&mut self, path: &str, create: bool) -> Result<&mut DirectoryNode, FsError> {
        let (name, rest) = match path.split_once('/') {
            Some((first, rest)) => (first, rest),
            None => (path, ""),
        };

        if create && rest.is_empty() {
            let node = self.insert(Node::Directory(DirectoryNode::new(name)));
            match node {
                Node::Directory(dir) => return Ok(dir),
                _ => unreachable!(),
            }
        }

        let child = match self.child_mut(name) {
            Some(Node::Directory(dir)) => dir,
            _ => return Err(FsError::LookupFailed),
        };
        if rest.is_empty() {
            Ok(child)
        } else {
            child.dir(rest, create)
        }
    }

    pub fn file(&mut self, name: &str, create: bool) -> Result<&mut FileNode, FsError> {
        if create {
            match self.insert(Node::File(FileNode::new(name))) {
                Node::File(file) => return Ok(file),
                _ => unreachable!(),
            }
        }
        match self.child_mut(name) {
            Some(Node::File(file)) => Ok(file),
            _ => Err(FsError::LookupFailed),
        }
    }

    pub fn symlink(&mut self, name: &str, create: bool) -> Result<&mut SymlinkNode, FsError> {
        if create {
            match self.insert(Node::Symlink(SymlinkNode::new(name))) {
                Node::Symlink(link) => return Ok(link),
                _ => unreachable!(),
            }
        }
        match self.child_mut(name) {
            Some(Node::Symlink(link)) => Ok(link),
            _ => Err(FsError::LookupFailed),
        }
    }

    pub fn remove(&mut self, name: &str) {
        if let Ok(at) = self.children.binary_search_by(|c| c.name().cmp(name)) {
            self.children.remove(at);
        }
    }

    /// Flush children depth first, absorbing each digest, then the
    /// framing. `path` is this directory's path on the backend.
    pub fn flush(&mut self, fs: &mut dyn FsSession, path: &str) -> Result<(), FsError> {
        let handle = fs.dir(path, false)?;

        let mut digest = [0u8; DIGEST_SIZE];
        // children were inserted in name order
        for child in self.children.iter_mut() {
            match child {
                Node::File(file) => {
                    let file_handle = fs.file(handle, file.name(), Mode::ReadOnly, false)?;
                    let flushed = file.flush(fs, file_handle);
                    fs.close(file_handle);
                    flushed?;
                    file.digest(&mut digest);
                }
                Node::Symlink(link) => {
                    link.flush();
                    link.digest(&mut digest);
                }
                Node::Directory(dir) => {
                    let sub_path = format!("{}/{}", path.trim_end_matches('/'), dir.name());
                    dir.flush(fs, &sub_path)?;
                    dir.digest(&mut digest);
                }
            }
            self.hash.update(&digest);
        }
        fs.close(handle);

        self.hash.update(DIRECTORY_FRAMING);
        self.hash.update(self.name.as_bytes());
        Ok(())
    }

    pub fn digest(&mut self, out: &mut [u8]) {
        self.hash.digest(out);
    }
}

/// A node of the ingest hash tree.
#[derive(Clone)]
pub enum Node {
    File(FileNode),
    Symlink(SymlinkNode),
    Directory(DirectoryNode),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::File(n) => n.name(),
            Node::Symlink(n) => n.name(),
            Node::Directory(n) => n.name(),
        }
    }

    /// Absorb a committed write into the node's hash state.
    pub fn write(&mut self, data: &[u8], offset: u64) {
        match self {
            Node::File(n) => n.write(data, offset),
            Node::Symlink(n) => n.write(data, offset),
            // writes never target directory nodes
            Node::Directory(_) => (),
        }
    }

    pub fn digest(&mut self, out: &mut [u8]) {
        match self {
            Node::File(n) => n.digest(out),
            Node::Symlink(n) => n.digest(out),
            Node::Directory(n) => n.digest(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalStore;
    use hex_literal::hex;
    use tempfile::TempDir;

    fn digest_of(node: &mut Node) -> [u8; DIGEST_SIZE] {
        let mut out = [0u8; DIGEST_SIZE];
        node.digest(&mut out);
        out
    }

    #[test]
    fn file_hash_with_framing() {
        let mut file = FileNode::new("out");
        file.write(b"hello", 0);

        let tmp = TempDir::new().unwrap();
        let mut fs = LocalStore::open(tmp.path()).unwrap();
        let root = fs.dir("/", false).unwrap();
        let backend = fs.file(root, "out", Mode::ReadWrite, true).unwrap();
        fs.submit(Packet::write(backend, 0, b"hello".to_vec()));
        fs.next_ack().unwrap();

        file.flush(&mut fs, backend).unwrap();
        let mut out = [0u8; DIGEST_SIZE];
        file.digest(&mut out);
        assert_eq!(
            out,
            hex!("5cb74885a26b11c26c404c1405b822c0317ee5bcaba7a0c533ff71ea5dcd7a3c")
        );
    }

    #[test]
    fn file_missed_writes_are_read_back() {
        // the node never sees the content; flush must recover it from
        // the backend
        let tmp = TempDir::new().unwrap();
        let mut fs = LocalStore::open(tmp.path()).unwrap();
        let root = fs.dir("/", false).unwrap();
        let backend = fs.file(root, "out", Mode::ReadWrite, true).unwrap();
        fs.submit(Packet::write(backend, 0, b"hello".to_vec()));
        fs.next_ack().unwrap();

        let mut file = FileNode::new("out");
        file.flush(&mut fs, backend).unwrap();

        let mut out = [0u8; DIGEST_SIZE];
        file.digest(&mut out);
        assert_eq!(
            out,
            hex!("5cb74885a26b11c26c404c1405b822c0317ee5bcaba7a0c533ff71ea5dcd7a3c")
        );
    }

    #[test]
    fn chunked_writes_match_single_write() {
        let mut whole = FileNode::new("n");
        whole.write(b"hello", 0);

        let mut parts = FileNode::new("n");
        parts.write(b"hel", 0);
        parts.write(b"lo", 3);

        let (mut a, mut b) = ([0u8; DIGEST_SIZE], [0u8; DIGEST_SIZE]);
        whole.digest(&mut a);
        parts.digest(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn sparse_write_is_dropped() {
        let mut file = FileNode::new("n");
        file.write(b"abc", 0);
        let mut before = [0u8; DIGEST_SIZE];
        file.digest(&mut before);

        file.write(b"xyz", 100);
        let mut after = [0u8; DIGEST_SIZE];
        file.digest(&mut after);
        assert_eq!(before, after);
    }

    #[test]
    fn rewind_restarts_the_stream() {
        let mut file = FileNode::new("n");
        file.write(b"garbage", 0);
        file.write(b"fresh", 0);

        let mut restarted = FileNode::new("n");
        restarted.write(b"fresh", 0);

        let (mut a, mut b) = ([0u8; DIGEST_SIZE], [0u8; DIGEST_SIZE]);
        file.digest(&mut a);
        restarted.digest(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_file_hashes_framing_only() {
        let tmp = TempDir::new().unwrap();
        let mut fs = LocalStore::open(tmp.path()).unwrap();
        let root = fs.dir("/", false).unwrap();
        let backend = fs.file(root, "empty", Mode::ReadWrite, true).unwrap();

        let mut file = FileNode::new("empty");
        file.flush(&mut fs, backend).unwrap();
        let mut out = [0u8; DIGEST_SIZE];
        file.digest(&mut out);

        // BLAKE2s("\0f\0empty")
        let mut expect = nichts_compat::hash::Blake2s::new();
        expect.update(b"\0f\0empty");
        let mut want = [0u8; DIGEST_SIZE];
        nichts_compat::hash::HashFunction::digest(&mut expect, &mut want);
        assert_eq!(out, want);
    }

    #[test]
    fn symlink_hash() {
        let mut link = SymlinkNode::new("link");
        link.write(b"some-target", 0);
        link.write(b"ignored", 5);
        link.flush();
        let mut out = [0u8; DIGEST_SIZE];
        link.digest(&mut out);
        assert_eq!(
            out,
            hex!("9eb0b48caa560fd7067139c2d5223df3b8a969ca571061cef30d34d14cb49576")
        );
    }

    #[test]
    fn directory_digest_over_sorted_children() {
        let tmp = TempDir::new().unwrap();
        let mut fs = LocalStore::open(tmp.path()).unwrap();
        fs.dir("/mydir", true).unwrap();
        let dir_handle = fs.dir("/mydir", false).unwrap();
        let f = fs.file(dir_handle, "a.txt", Mode::ReadWrite, true).unwrap();
        fs.submit(Packet::write(f, 0, b"AAA".to_vec()));
        fs.next_ack().unwrap();
        fs.close(f);

        let mut dir = DirectoryNode::new("mydir");
        // insert out of order; hashing follows name order
        let link = dir.symlink("l", true).unwrap();
        link.write(b"a.txt", 0);
        let file = dir.file("a.txt", true).unwrap();
        file.write(b"AAA", 0);

        dir.flush(&mut fs, "/mydir").unwrap();
        let mut out = [0u8; DIGEST_SIZE];
        dir.digest(&mut out);
        assert_eq!(
            nichts_compat::store_name::encode(&out, "mydir"),
            "120z70k8j5j66xwy365ibqa0j7fdp8la-mydir"
        );
    }

    #[test]
    fn nested_directories() {
        let tmp = TempDir::new().unwrap();
        let mut fs = LocalStore::open(tmp.path()).unwrap();
        fs.dir("/top", true).unwrap();
        fs.dir("/top/sub", true).unwrap();
        let top_h = fs.dir("/top", false).unwrap();
        let sub_h = fs.dir("/top/sub", false).unwrap();
        for (h, name, content) in [(sub_h, "f", b"x"), (top_h, "g", b"y")] {
            let f = fs.file(h, name, Mode::ReadWrite, true).unwrap();
            fs.submit(Packet::write(f, 0, content.to_vec()));
            fs.next_ack().unwrap();
            fs.close(f);
        }

        let mut top = DirectoryNode::new("top");
        top.file("g", true).unwrap().write(b"y", 0);
        let sub = top.dir("sub", true).unwrap();
        sub.file("f", true).unwrap().write(b"x", 0);

        top.flush(&mut fs, "/top").unwrap();
        let mut out = [0u8; DIGEST_SIZE];
        top.digest(&mut out);
        assert_eq!(
            nichts_compat::store_name::encode(&out, "top"),
            "bps21jkrh3aryg8wh39flzhxmbzp3far-top"
        );
    }

    #[test]
    fn duplicate_insert_overwrites() {
        let mut dir = DirectoryNode::new("d");
        dir.file("x", true).unwrap().write(b"old", 0);
        // re-creating the same name discards the old node
        dir.file("x", true).unwrap().write(b"new", 0);

        let mut fresh = DirectoryNode::new("d");
        fresh.file("x", true).unwrap().write(b"new", 0);

        let mut a = Node::Directory(dir);
        let mut b = Node::Directory(fresh);
        // digests before flush only cover children names seen so far;
        // compare the file digests instead
        match (&mut a, &mut b) {
            (Node::Directory(da), Node::Directory(db)) => {
                let fa = da.file("x", false).unwrap();
                let fb = db.file("x", false).unwrap();
                let (mut x, mut y) = ([0u8; DIGEST_SIZE], [0u8; DIGEST_SIZE]);
                fa.digest(&mut x);
                fb.digest(&mut y);
                assert_eq!(x, y);
            }
            _ => unreachable!(),
        }
        let _ = digest_of(&mut a);
    }

    #[test]
    fn lookup_missing_child_fails() {
        let mut dir = DirectoryNode::new("d");
        assert!(dir.file("absent", false).is_err());
        assert!(dir.symlink("absent", false).is_err());
        assert!(dir.dir("absent", false).is_err());
    }
}
