//! A read-only view of the store restricted to a fixed set of
//! top-level objects.
//!
//! Build processes see the store through this session, so the objects
//! they can name are exactly the inputs their derivation declared
//! (including the content-addressed targets of input symlinks). Every
//! mutating operation is refused.

use std::collections::BTreeSet;
use std::collections::VecDeque;

use crate::errors::FsError;
use crate::session::{
    split_first_element, Control, DirEntry, FsSession, Handle, Mode, Notifier, Packet, PacketOp,
    Status, DIRENT_SIZE,
};
use crate::util;

pub struct FilterSession {
    backend: Box<dyn FsSession>,
    root_handle: Handle,
    whitelist: BTreeSet<String>,
    acks: VecDeque<Packet>,
}

impl FilterSession {
    /// Open a filtered view exposing exactly `whitelist`.
    pub fn new(
        mut backend: Box<dyn FsSession>,
        whitelist: impl IntoIterator<Item = String>,
    ) -> Result<Self, FsError> {
        let root_handle = backend.dir("/", false)?;
        Ok(FilterSession {
            backend,
            root_handle,
            whitelist: whitelist.into_iter().collect(),
            acks: VecDeque::new(),
        })
    }

    fn verify(&self, name: &str) -> Result<(), FsError> {
        if self.whitelist.contains(name) {
            Ok(())
        } else {
            Err(FsError::LookupFailed)
        }
    }

    fn verify_path(&self, path: &str) -> Result<(), FsError> {
        let (first, _) = split_first_element(path);
        self.verify(first)
    }

    /// The root listing, reduced to whitelisted entries.
    fn filtered_listing(&mut self) -> Result<Vec<u8>, FsError> {
        let entries = util::read_dir_entries(self.backend.as_mut(), self.root_handle)?;
        let mut out = Vec::new();
        for entry in entries {
            if self.whitelist.contains(&entry.name) {
                out.extend_from_slice(&DirEntry::encode(&entry));
            }
        }
        Ok(out)
    }
}

impl FsSession for FilterSession {
    fn dir(&mut self, path: &str, create: bool) -> Result<Handle, FsError> {
        if create {
            return Err(FsError::PermissionDenied);
        }
        if path == "/" || path.is_empty() {
            return Ok(self.root_handle);
        }
        self.verify_path(path)?;
        self.backend.dir(path, false)
    }

    fn file(
        &mut self,
        dir: Handle,
        name: &str,
        mode: Mode,
        create: bool,
    ) -> Result<Handle, FsError> {
        if create || mode.writeable() {
            return Err(FsError::PermissionDenied);
        }
        if dir == self.root_handle {
            self.verify(name)?;
        }
        self.backend.file(dir, name, Mode::ReadOnly, false)
    }

    fn symlink(&mut self, dir: Handle, name: &str, create: bool) -> Result<Handle, FsError> {
        if create {
            return Err(FsError::PermissionDenied);
        }
        if dir == self.root_handle {
            self.verify(name)?;
        }
        self.backend.symlink(dir, name, false)
    }

    fn node(&mut self, path: &str) -> Result<Handle, FsError> {
        if path == "/" || path.is_empty() {
            return Ok(self.root_handle);
        }
        self.verify_path(path)?;
        self.backend.node(path)
    }

    fn status(&mut self, handle: Handle) -> Result<Status, FsError> {
        if handle == self.root_handle {
            let mut status = self.backend.status(handle)?;
            status.size = self.filtered_listing()?.len() as u64;
            return Ok(status);
        }
        self.backend.status(handle)
    }

    fn close(&mut self, handle: Handle) {
        if handle == self.root_handle {
            return;
        }
        self.backend.close(handle);
    }

    fn unlink(&mut self, _dir: Handle, _name: &str) -> Result<(), FsError> {
        Err(FsError::PermissionDenied)
    }

    fn truncate(&mut self, _handle: Handle, _len: u64) -> Result<(), FsError> {
        Err(FsError::PermissionDenied)
    }

    fn rename(
        &mut self,
        _from_dir: Handle,
        _from_name: &str,
        _to_dir: Handle,
        _to_name: &str,
    ) -> Result<(), FsError> {
        Err(FsError::PermissionDenied)
    }

    fn sigh(&mut self, _handle: Handle, _notifier: Notifier) -> Result<(), FsError> {
        Err(FsError::PermissionDenied)
    }

    fn control(&mut self, handle: Handle, op: Control) -> Result<(), FsError> {
        self.backend.control(handle, op)
    }

    fn submit(&mut self, mut packet: Packet) {
        if packet.op == PacketOp::Write {
            packet.succeeded = false;
            packet.length = 0;
            self.acks.push_back(packet);
            return;
        }
        if packet.handle == self.root_handle {
            match self.filtered_listing() {
                Ok(listing) => {
                    let start = (packet.position as usize).min(listing.len());
                    let end = (start + packet.length).min(listing.len());
                    packet.payload = listing[start..end].to_vec();
                    packet.length = packet.payload.len();
                    packet.succeeded = true;
                }
                Err(_) => {
                    packet.succeeded = false;
                    packet.length = 0;
                }
            }
            self.acks.push_back(packet);
            return;
        }
        self.backend.submit(packet);
        while let Some(ack) = self.backend.next_ack() {
            self.acks.push_back(ack);
        }
    }

    fn next_ack(&mut self) -> Option<Packet> {
        self.acks.pop_front()
    }
}
