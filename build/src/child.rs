//! One sandboxed build.
//!
//! A build child runs the derivation's builder with exactly the
//! capabilities its derivation grants: a writeable ingest session fenced
//! to the declared outputs, a read-only store view filtered to the
//! declared inputs, ROMs resolved through the rewritten environment, and
//! a log channel labeled with the job name. Every other request is an
//! impurity and is refused.
//!
//! Builder binaries are store objects executed as host components; the
//! [`ProgramResolver`] seam stands in for component loading and maps a
//! builder path to runnable code.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use bstr::BString;
use data_encoding::HEXLOWER;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use nichts_compat::derivation::Derivation;
use nichts_compat::hash::{HashAlgo, HashFunction};
use nichts_store::{util, FilterSession, FsSession, IngestSession, LocalStore};

use crate::environment::{load_derivation, Environment, Inputs};
use crate::errors::{BuildError, ServiceDenied};
use crate::job::Event;

/// Exit status of a builder program.
pub type ExitCode = i32;

type ProgramFuture<'a> = Pin<Box<dyn Future<Output = ExitCode> + Send + 'a>>;

/// A runnable builder.
pub trait BuilderProgram: Send + Sync {
    fn run<'a>(&'a self, services: &'a mut ChildServices) -> ProgramFuture<'a>;
}

/// Maps a derivation's builder path to a runnable program.
pub trait ProgramResolver: Send + Sync {
    fn resolve(&self, builder: &str) -> Option<Arc<dyn BuilderProgram>>;
}

/// Wrap a synchronous closure as a [`BuilderProgram`].
pub fn program<F>(f: F) -> Arc<dyn BuilderProgram>
where
    F: Fn(&mut ChildServices) -> ExitCode + Send + Sync + 'static,
{
    struct SyncProgram<F>(F);
    impl<F> BuilderProgram for SyncProgram<F>
    where
        F: Fn(&mut ChildServices) -> ExitCode + Send + Sync + 'static,
    {
        fn run<'a>(&'a self, services: &'a mut ChildServices) -> ProgramFuture<'a> {
            Box::pin(std::future::ready((self.0)(services)))
        }
    }
    Arc::new(SyncProgram(f))
}

/// Shared configuration for spawning build children.
pub struct ChildConfig {
    /// Directory of the durable store.
    pub store_root: PathBuf,
    pub resolver: Arc<dyn ProgramResolver>,
}

/// The capabilities a builder runs with.
pub struct ChildServices {
    name: String,
    drv: Derivation,
    drv_bytes: Vec<u8>,
    environment: Environment,
    ingest: IngestSession,
    filter: FilterSession,
    /// Direct store session for serving ROM content.
    store: LocalStore,
    store_root: PathBuf,
    /// Read-only sessions opened for env-resolved filesystem roots.
    rooted: Vec<Box<dyn FsSession>>,
    impure_services: HashSet<String>,
    events: mpsc::UnboundedSender<Event>,
}

impl ChildServices {
    /// Request a ROM by label.
    ///
    /// `binary` resolves to the derivation's builder, `config` to the
    /// raw derivation bytes; any other label must resolve through the
    /// environment to a declared input.
    pub fn rom(&mut self, label: &str) -> Result<Vec<u8>, ServiceDenied> {
        match label {
            "binary" => {
                let builder = self.drv.builder.trim_start_matches('/').to_string();
                let content = util::dereference(&mut self.store, &builder)
                    .map_err(|_| ServiceDenied)?;
                util::read_file(&mut self.store, &format!("/{content}"))
                    .map_err(|_| ServiceDenied)
            }
            "config" => Ok(self.drv_bytes.clone()),
            _ => match self.environment.lookup_str(label) {
                Some(path) => {
                    let path = format!("/{}", path.trim_start_matches('/'));
                    util::read_file(&mut self.store, &path).map_err(|_| ServiceDenied)
                }
                None => {
                    error!(job = %self.name, label, "impure ROM request");
                    Err(ServiceDenied)
                }
            },
        }
    }

    /// Request a filesystem session.
    ///
    /// The `ingest` label yields the writeable output session; a root of
    /// `/` yields the filtered store view; any other root must resolve
    /// through the environment and is handed out read-only.
    pub fn filesystem(
        &mut self,
        label: &str,
        root: &str,
    ) -> Result<&mut dyn FsSession, ServiceDenied> {
        if label == "ingest" {
            return Ok(&mut self.ingest);
        }
        if root.is_empty() || root == "/" {
            return Ok(&mut self.filter);
        }
        let root = root.trim_start_matches('/');
        match self.environment.lookup_str(root) {
            Some(dest) => {
                let session = LocalStore::open_read_only(self.store_root.join(dest))
                    .map_err(|_| ServiceDenied)?;
                self.rooted.push(Box::new(session));
                Ok(self.rooted.last_mut().expect("just pushed").as_mut())
            }
            None => {
                error!(job = %self.name, root, "impure filesystem request");
                Err(ServiceDenied)
            }
        }
    }

    /// Request a session to a service by name.
    ///
    /// The environment services every child runs on are always routed
    /// to the parent. Anything else is forwarded only when a
    /// fixed-output derivation declared it impure.
    pub fn service(&self, name: &str) -> Result<(), ServiceDenied> {
        if matches!(name, "Ram" | "Cpu" | "Pd" | "Log" | "Timer") {
            return Ok(());
        }
        if self.impure_services.contains(name) {
            info!(job = %self.name, service = name, "forwarding impure service");
            Ok(())
        } else {
            error!(job = %self.name, service = name, "service request rejected");
            Err(ServiceDenied)
        }
    }

    /// Write a line to the build log, labeled with the job name.
    pub fn log(&self, message: &str) {
        info!(target: "builder", job = %self.name, "{message}");
    }

    /// A resolved environment value.
    pub fn env(&self, key: &str) -> Option<&BString> {
        self.environment.lookup(key)
    }

    pub fn environment(&self) -> impl Iterator<Item = (&str, &BString)> {
        self.environment.iter()
    }

    /// Ask the scheduler for more memory.
    pub fn resource_request(&self, ram_quota: u64) {
        let _ = self.events.send(Event::ChildResourceRequest { ram_quota });
    }
}

/// Run one build to completion and report the exit to the scheduler.
pub(crate) async fn run(
    config: Arc<ChildConfig>,
    name: String,
    events: mpsc::UnboundedSender<Event>,
) {
    let success = match build(&config, &name, &events).await {
        Ok(success) => success,
        Err(e) => {
            error!(job = %name, %e, "build did not start");
            false
        }
    };

    if success {
        info!(job = %name, "success");
    } else {
        error!(job = %name, "failure");
    }
    let _ = events.send(Event::ChildExit);
}

async fn build(
    config: &Arc<ChildConfig>,
    name: &str,
    events: &mpsc::UnboundedSender<Event>,
) -> Result<bool, BuildError> {
    let mut store = LocalStore::open(&config.store_root)?;
    let (drv, drv_bytes) = load_derivation(&mut store, name)?;

    let inputs = Inputs::resolve(&mut store, &drv)?;
    let environment = Environment::resolve(&mut store, &drv, &inputs);
    let whitelist = inputs.whitelist(&mut store);

    // the builder itself must be a declared, present store object
    let builder = drv.builder.trim_start_matches('/').to_string();
    util::dereference(&mut store, &builder)
        .map_err(|_| BuildError::MissingDependency(builder.clone()))?;

    let filter = FilterSession::new(
        Box::new(LocalStore::open_read_only(&config.store_root)?),
        whitelist,
    )?;

    let mut ingest = IngestSession::new(Box::new(LocalStore::open(&config.store_root)?))?;
    for output in &drv.outputs {
        // fence the build to exactly its declared outputs
        ingest.expect(&output.id);
    }

    let impure_services = if drv.has_fixed_output() {
        match environment.lookup_str("impureServices") {
            Some(list) => list.split_whitespace().map(str::to_string).collect(),
            None => {
                warn!(job = %name, "fixed-output derivation without `impureServices'");
                HashSet::new()
            }
        }
    } else {
        HashSet::new()
    };

    let program = config
        .resolver
        .resolve(&drv.builder)
        .ok_or_else(|| BuildError::MissingBuilder(drv.builder.clone()))?;

    let mut services = ChildServices {
        name: name.to_string(),
        drv,
        drv_bytes,
        environment,
        ingest,
        filter,
        store,
        store_root: config.store_root.clone(),
        rooted: Vec::new(),
        impure_services,
        events: events.clone(),
    };

    let exit_value = program.run(&mut services).await;
    if exit_value != 0 {
        return Ok(false);
    }
    Ok(finalize(&mut services))
}

/// Finalize every declared output and publish the input-addressed
/// symlinks. Links are only created once all outputs are present and
/// verified.
fn finalize(services: &mut ChildServices) -> bool {
    services.ingest.revoke_session();

    let outputs = services.drv.outputs.clone();
    let mut finals = Vec::with_capacity(outputs.len());

    for output in &outputs {
        let final_name = match services.ingest.ingest(&output.id) {
            Ok(final_name) => final_name,
            Err(_) => {
                // a missing output symlink is an implicit failure
                error!(id = %output.id, "output not found at the ingest session");
                return false;
            }
        };

        if !output.hash_algo.is_empty() || !output.hash_hex.is_empty() {
            if !verify_fixed_output(
                &mut services.store,
                &output.hash_algo,
                &output.hash_hex,
                &final_name,
            ) {
                error!(id = %output.id, path = %output.path, "fixed output is invalid");
                return false;
            }
        }
        finals.push(final_name);
    }

    let root = match services.store.dir("/", false) {
        Ok(root) => root,
        Err(_) => return false,
    };
    let mut success = true;
    for (output, final_name) in outputs.iter().zip(&finals) {
        let link = output.path.trim_start_matches('/');
        if let Err(e) = util::write_symlink(&mut services.store, root, link, final_name) {
            error!(link, %final_name, ?e, "error creating output symlink");
            success = false;
        }
    }
    services.store.close(root);
    success
}

/// Hash the finalized output file with the declared algorithm and
/// compare digests.
fn verify_fixed_output(
    fs: &mut LocalStore,
    algo_name: &str,
    declared_hex: &str,
    final_name: &str,
) -> bool {
    let Some(algo) = HashAlgo::from_name(algo_name) else {
        error!(algo = algo_name, "unknown hash algorithm");
        return false;
    };

    let content = match util::read_file(fs, &format!("/{final_name}")) {
        Ok(content) => content,
        Err(e) => {
            error!(%final_name, ?e, "cannot read fixed output back for verification");
            return false;
        }
    };

    let mut hash = algo.function();
    hash.update(&content);
    let mut digest = vec![0u8; hash.size()];
    hash.digest(&mut digest);

    let got = HEXLOWER.encode(&digest);
    if got.eq_ignore_ascii_case(declared_hex) {
        return true;
    }
    error!(%final_name, wanted = declared_hex, %got, "fixed output digest mismatch");
    false
}
