//! Helpers over the filesystem-session surface: whole-node reads,
//! symlink plumbing, chain dereferencing and recursive removal.

use crate::errors::FsError;
use crate::session::{DirEntry, FsSession, Handle, NodeKind, Packet, DIRENT_SIZE};

const CHUNK: usize = 4096;

/// Longest symlink chain [`dereference`] will follow.
const MAX_CHAIN: usize = 32;

/// Read a node's content from position 0 until EOF.
pub fn read_node(fs: &mut dyn FsSession, handle: Handle) -> Result<Vec<u8>, FsError> {
    let mut out = Vec::new();
    loop {
        fs.submit(Packet::read(handle, out.len() as u64, CHUNK));
        let ack = fs.next_ack().ok_or(FsError::InvalidHandle)?;
        if !ack.succeeded {
            if out.is_empty() {
                return Err(FsError::LookupFailed);
            }
            break;
        }
        if ack.length == 0 {
            break;
        }
        out.extend_from_slice(&ack.payload);
        if ack.length < CHUNK {
            break;
        }
    }
    Ok(out)
}

/// Read the whole file at `path`.
pub fn read_file(fs: &mut dyn FsSession, path: &str) -> Result<Vec<u8>, FsError> {
    let handle = fs.node(path)?;
    let status = fs.status(handle);
    let content = match status {
        Ok(s) if s.kind == NodeKind::File => read_node(fs, handle),
        Ok(_) => Err(FsError::LookupFailed),
        Err(e) => Err(e),
    };
    fs.close(handle);
    content
}

/// Read the target of the symlink `name` under `dir`.
pub fn read_symlink(fs: &mut dyn FsSession, dir: Handle, name: &str) -> Result<String, FsError> {
    let handle = fs.symlink(dir, name, false)?;
    let content = read_node(fs, handle);
    fs.close(handle);
    let bytes = content?;
    String::from_utf8(bytes).map_err(|_| FsError::LookupFailed)
}

/// Create (or replace the target of) the symlink `name` under `dir`.
pub fn write_symlink(
    fs: &mut dyn FsSession,
    dir: Handle,
    name: &str,
    target: &str,
) -> Result<(), FsError> {
    let handle = match fs.symlink(dir, name, true) {
        Ok(handle) => handle,
        Err(FsError::NodeAlreadyExists) => {
            tracing::warn!(name, "a symlink is already present, rewriting it");
            fs.symlink(dir, name, false)?
        }
        Err(e) => return Err(e),
    };
    fs.submit(Packet::write(handle, 0, target.as_bytes().to_vec()));
    let ack = fs.next_ack();
    fs.close(handle);
    match ack {
        Some(ack) if ack.succeeded && ack.length == target.len() => Ok(()),
        _ => Err(FsError::PermissionDenied),
    }
}

/// List a directory handle.
pub fn read_dir_entries(fs: &mut dyn FsSession, dir: Handle) -> Result<Vec<DirEntry>, FsError> {
    let handle_bytes = read_node(fs, dir)?;
    Ok(handle_bytes
        .chunks(DIRENT_SIZE)
        .filter_map(DirEntry::decode)
        .collect())
}

/// Follow the symlink chain from a top-level `name` to a non-symlink
/// object and return its name.
///
/// Targets containing `/` are refused, as is a chain longer than
/// [`MAX_CHAIN`].
pub fn dereference(fs: &mut dyn FsSession, name: &str) -> Result<String, FsError> {
    let mut current = name.trim_start_matches('/').to_string();
    if current.is_empty() {
        return Err(FsError::LookupFailed);
    }

    for _ in 0..MAX_CHAIN {
        let node = fs.node(&format!("/{current}"))?;
        let status = fs.status(node);
        fs.close(node);

        match status?.kind {
            NodeKind::File | NodeKind::Directory => return Ok(current),
            NodeKind::Symlink => {
                let root = fs.dir("/", false)?;
                let target = read_symlink(fs, root, &current);
                fs.close(root);
                let target = target?;
                if target.is_empty() || target.contains('/') || target == current {
                    return Err(FsError::LookupFailed);
                }
                current = target;
            }
        }
    }
    Err(FsError::LookupFailed)
}

/// Recursively delete the contents of the directory at `path`.
pub fn empty_dir(fs: &mut dyn FsSession, path: &str) -> Result<(), FsError> {
    let dir = fs.dir(path, false)?;
    let result = (|| {
        loop {
            let entries = read_dir_entries(fs, dir)?;
            if entries.is_empty() {
                return Ok(());
            }
            for entry in entries {
                match fs.unlink(dir, &entry.name) {
                    Ok(()) => (),
                    Err(FsError::NotEmpty) => {
                        empty_dir(fs, &format!("{}/{}", path.trim_end_matches('/'), entry.name))?;
                        fs.unlink(dir, &entry.name)?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    })();
    fs.close(dir);
    result
}
