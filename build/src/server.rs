//! The public store-session surface: validity queries, symlink
//! dereferencing and realization of derivations.

use std::path::Path;

use tokio::sync::mpsc;
use tracing::{debug, error};

use nichts_store::{util, FsError, FsSession, Handle, LocalStore, NodeKind};

use crate::environment::load_derivation;
use crate::errors::{BuildError, RealizeError};
use crate::job::{Completion, Event};

/// Bound on `valid` recursion through symlink chains.
const MAX_VALID_DEPTH: usize = 32;

/// Placeholder used by the start-up access check.
const PLACEHOLDER: &str = ".builder";

pub struct BuildSession {
    fs: LocalStore,
    root: Handle,
    platform: String,
    jobs: mpsc::UnboundedSender<Event>,
}

impl BuildSession {
    /// Open a session over the store.
    ///
    /// Write access to the store root is verified up front by creating
    /// and deleting a placeholder file; refusing the session early is
    /// better than failing the first build halfway through.
    pub fn new(
        store_root: &Path,
        platform: &str,
        jobs: mpsc::UnboundedSender<Event>,
    ) -> Result<Self, FsError> {
        let mut fs = LocalStore::open(store_root)?;
        let root = fs.dir("/", false)?;

        match fs.unlink(root, PLACEHOLDER) {
            Ok(()) | Err(FsError::LookupFailed) => (),
            Err(e) => return Err(e),
        }
        let placeholder = fs.file(root, PLACEHOLDER, nichts_store::Mode::ReadWrite, true)?;
        fs.close(placeholder);
        fs.unlink(root, PLACEHOLDER)?;

        Ok(BuildSession {
            fs,
            root,
            platform: platform.to_string(),
            jobs,
        })
    }

    /// True if a store object exists under `name` and is a regular
    /// file, a directory, or a symlink to another valid object.
    pub fn valid(&mut self, name: &str) -> bool {
        self.valid_at(name, 0)
    }

    fn valid_at(&mut self, name: &str, depth: usize) -> bool {
        if depth > MAX_VALID_DEPTH {
            return false;
        }
        let name = name.trim_start_matches('/');
        if name.is_empty() {
            return false;
        }

        let node = match self.fs.node(&format!("/{name}")) {
            Ok(node) => node,
            Err(_) => return false,
        };
        let status = self.fs.status(node);
        self.fs.close(node);

        match status.map(|s| s.kind) {
            Ok(NodeKind::File) | Ok(NodeKind::Directory) => true,
            Ok(NodeKind::Symlink) => {
                let target = match util::read_symlink(&mut self.fs, self.root, name) {
                    Ok(target) => target,
                    Err(_) => return false,
                };
                // only single-element targets keep the recursion bounded
                if target.contains('/') {
                    return false;
                }
                // it would be embarrassing to run in a loop
                if target != name {
                    return self.valid_at(&target, depth + 1);
                }
                false
            }
            Err(_) => false,
        }
    }

    /// Resolve an input-addressed name to its content-addressed name.
    /// Returns the empty string if the object is absent.
    pub fn dereference(&mut self, name: &str) -> String {
        util::dereference(&mut self.fs, name).unwrap_or_default()
    }

    /// Schedule the builds needed to make the outputs of `drv_name`
    /// valid. Completion (success or failure) is signaled through
    /// `listener`; the caller then observes the outcome via
    /// [`BuildSession::valid`].
    pub fn realize(&mut self, drv_name: &str, listener: Completion) -> Result<(), RealizeError> {
        if drv_name.contains('/') {
            error!(name = drv_name, "invalid derivation name");
            return Err(RealizeError::InvalidDerivation(drv_name.to_string()));
        }

        let (drv, _) = load_derivation(&mut self.fs, drv_name)
            .map_err(|e| RealizeError::InvalidDerivation(e.to_string()))?;

        if drv.platform != self.platform {
            error!(
                name = drv_name,
                platform = %drv.platform,
                host = %self.platform,
                "derivation platform does not match this host"
            );
            return Err(RealizeError::InvalidDerivation(drv_name.to_string()));
        }

        // nothing to do if every output is already in the store
        if drv
            .outputs
            .iter()
            .all(|output| self.valid(output.path.trim_start_matches('/')))
        {
            debug!(name = drv_name, "outputs already valid");
            let _ = listener.send(());
            return Ok(());
        }

        self.check_inputs(&drv)?;

        debug!(name = drv_name, "queueing realization");
        let _ = self.jobs.send(Event::Queue {
            name: drv_name.to_string(),
            listener,
        });
        Ok(())
    }

    /// Verify that every input of `drv` is present in the store. No
    /// partial job is enqueued when a dependency is missing.
    fn check_inputs(
        &mut self,
        drv: &nichts_compat::derivation::Derivation,
    ) -> Result<(), RealizeError> {
        for input in &drv.input_derivations {
            let (dependency, _) = load_derivation(&mut self.fs, &input.derivation)
                .map_err(|e| RealizeError::InvalidDerivation(e.to_string()))?;

            for want_id in &input.outputs {
                for output in &dependency.outputs {
                    if output.id != *want_id {
                        continue;
                    }
                    let path = output.path.trim_start_matches('/');
                    if !self.valid(path) {
                        error!(missing = path, "missing dependency");
                        return Err(RealizeError::MissingDependency(path.to_string()));
                    }
                }
            }
        }

        for source in &drv.input_sources {
            let source = source.trim_start_matches('/');
            if !self.valid(source) {
                error!(missing = source, "missing source");
                return Err(RealizeError::MissingDependency(source.to_string()));
            }
        }
        Ok(())
    }
}

impl From<BuildError> for RealizeError {
    fn from(e: BuildError) -> Self {
        match e {
            BuildError::MissingDependency(name) => RealizeError::MissingDependency(name),
            other => RealizeError::InvalidDerivation(other.to_string()),
        }
    }
}
