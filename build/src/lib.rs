//! The derivation realizer: resolves a derivation's inputs to
//! content-addressed paths, schedules at-most-once builds, runs each
//! builder behind a purity-enforcing service policy, and publishes the
//! finished outputs in the store.

pub mod child;
pub mod environment;
mod errors;
pub mod job;
mod server;

pub use child::{program, BuilderProgram, ChildConfig, ChildServices, ProgramResolver};
pub use errors::{BuildError, RealizeError, ServiceDenied};
pub use job::{Completion, Event, Jobs, SchedulerHandle, QUOTA_RESERVE, QUOTA_STEP};
pub use server::BuildSession;
