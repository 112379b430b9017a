//! Job queuing.
//!
//! Realizations are queued in a simplex FIFO with one build in flight
//! at a time. Clients requesting a derivation that is already queued
//! are attached as additional listeners, so a build runs at most once
//! however many clients ask for it. The scheduler reacts to three
//! events besides enqueues: resource announcements, yield requests and
//! child exits.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::child::{self, ChildConfig};

pub const MEGABYTE: u64 = 1 << 20;

/// Initial memory grant per build child.
pub const QUOTA_STEP: u64 = 8 * MEGABYTE;

/// Memory the scheduler keeps for itself.
pub const QUOTA_RESERVE: u64 = MEGABYTE;

/// Completion handles are plain oneshot senders; the receiver side is
/// the client's notification channel.
pub type Completion = oneshot::Sender<()>;

/// Events driving the scheduler.
pub enum Event {
    /// Queue a realization of `name`.
    Queue { name: String, listener: Completion },
    /// The parent made more memory available.
    ResourceAvail { amount: u64 },
    /// The parent asks the scheduler to give memory back.
    YieldRequest {
        ram_quota: u64,
        reply: oneshot::Sender<()>,
    },
    /// The running child asks for more memory.
    ChildResourceRequest { ram_quota: u64 },
    /// The running child exited (or failed to start).
    ChildExit,
}

/// Notifies one waiting client. The listener stays valid as long as
/// the client keeps its receiver; dropping the listener fires the
/// notification exactly once.
struct Listener {
    sigh: Option<Completion>,
}

impl Listener {
    fn new(sigh: Completion) -> Self {
        Listener { sigh: Some(sigh) }
    }

    fn valid(&self) -> bool {
        self.sigh.as_ref().is_some_and(|s| !s.is_closed())
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(sigh) = self.sigh.take() {
            let _ = sigh.send(());
        }
    }
}

struct Child {
    task: tokio::task::JoinHandle<()>,
    granted: u64,
}

impl Drop for Child {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A queued realization and the clients waiting on it.
struct Job {
    name: String,
    listeners: Vec<Listener>,
    child: Option<Child>,
}

impl Job {
    fn new(name: String) -> Self {
        Job {
            name,
            listeners: Vec::new(),
            child: None,
        }
    }

    /// True once no listener is waiting anymore. Invalid listeners are
    /// collected on the way.
    fn abandoned(&mut self) -> bool {
        self.listeners.retain(Listener::valid);
        self.listeners.is_empty()
    }
}

pub struct Jobs {
    config: Arc<ChildConfig>,
    queue: VecDeque<Job>,
    pending: bool,
    ram_avail: u64,
    /// Children report exits through this.
    events: mpsc::UnboundedSender<Event>,
    /// Resource requests the scheduler cannot satisfy locally.
    upstream: mpsc::UnboundedSender<u64>,
}

/// Everything the embedder needs to drive a scheduler.
pub struct SchedulerHandle {
    pub events: mpsc::UnboundedSender<Event>,
    /// Memory amounts requested from the parent.
    pub upstream: mpsc::UnboundedReceiver<u64>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Jobs {
    /// Spawn a scheduler task over `config` with `ram_total` bytes of
    /// memory to hand out.
    pub fn spawn(config: ChildConfig, ram_total: u64) -> SchedulerHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
        let jobs = Jobs {
            config: Arc::new(config),
            queue: VecDeque::new(),
            pending: false,
            ram_avail: ram_total,
            events: events_tx.clone(),
            upstream: upstream_tx,
        };
        let task = tokio::spawn(jobs.run(events_rx));
        SchedulerHandle {
            events: events_tx,
            upstream: upstream_rx,
            task,
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Queue { name, listener } => self.queue(name, listener),
            Event::ResourceAvail { amount } => {
                self.ram_avail += amount;
                if self.pending {
                    self.upgrade_child();
                } else {
                    self.process();
                }
            }
            Event::YieldRequest { ram_quota, reply } => {
                self.yield_ram(ram_quota);
                let _ = reply.send(());
            }
            Event::ChildResourceRequest { ram_quota } => self.child_request(ram_quota),
            Event::ChildExit => {
                // the job's destructor notifies its listeners
                if let Some(mut job) = self.queue.pop_front() {
                    if let Some(child) = job.child.take() {
                        self.ram_avail += child.granted;
                    }
                }
                self.pending = false;
                self.process();
            }
        }
    }

    fn queue(&mut self, name: String, listener: Completion) {
        match self.queue.iter_mut().find(|job| job.name == name) {
            Some(job) => {
                // the build is already queued, just wait on it
                job.listeners.push(Listener::new(listener));
            }
            None => {
                let mut job = Job::new(name);
                job.listeners.push(Listener::new(listener));
                self.queue.push_back(job);
            }
        }
        self.process();
    }

    /// Start the job at the head of the queue if memory permits.
    fn process(&mut self) {
        if self.pending {
            return;
        }

        loop {
            let abandoned = match self.queue.front_mut() {
                None => return,
                Some(job) => job.abandoned(),
            };
            if !abandoned {
                break;
            }
            if let Some(job) = self.queue.pop_front() {
                debug!(job = %job.name, "dropping abandoned job");
            }
        }

        if self.ram_avail > QUOTA_STEP + QUOTA_RESERVE {
            let job = self.queue.front_mut().expect("head checked above");
            let task = tokio::spawn(child::run(
                self.config.clone(),
                job.name.clone(),
                self.events.clone(),
            ));
            job.child = Some(Child {
                task,
                granted: QUOTA_STEP,
            });
            self.ram_avail -= QUOTA_STEP;
            self.pending = true;
        } else {
            debug!("requesting more RAM before starting job");
            let _ = self.upstream.send(QUOTA_STEP);
        }
    }

    /// Hand the running child whatever is available beyond the reserve.
    fn upgrade_child(&mut self) {
        if self.ram_avail <= QUOTA_RESERVE {
            return;
        }
        let transfer = self.ram_avail - QUOTA_RESERVE;
        if let Some(job) = self.queue.front_mut() {
            if let Some(child) = &mut job.child {
                child.granted += transfer;
                self.ram_avail -= transfer;
            }
        }
    }

    /// Give memory back to the parent.
    ///
    /// When memory is low and the parent wants more than one quota
    /// step, the running build is killed; it stays at the head of the
    /// queue and restarts once memory returns. The child is not asked
    /// to yield, that would violate the purity of its environment.
    fn yield_ram(&mut self, ram_quota: u64) {
        if self.ram_avail < QUOTA_STEP && ram_quota > QUOTA_STEP {
            if let Some(job) = self.queue.front_mut() {
                if let Some(child) = job.child.take() {
                    self.ram_avail += child.granted;
                    error!(job = %job.name, "killed to yield resources");
                    self.pending = false;
                }
            }
        }
        let withdraw = self.ram_avail.min(ram_quota);
        self.ram_avail -= withdraw;
    }

    /// Grant a child request locally or forward it upstream.
    fn child_request(&mut self, ram_quota: u64) {
        let request = ram_quota.max(QUOTA_STEP);
        if self.ram_avail > request + QUOTA_RESERVE {
            if let Some(job) = self.queue.front_mut() {
                if let Some(child) = &mut job.child {
                    child.granted += request;
                    self.ram_avail -= request;
                    info!(job = %job.name, request, "granted child resource request");
                    return;
                }
            }
        }
        let _ = self.upstream.send(request);
    }
}
