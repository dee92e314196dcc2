//! Service layer
//!
//! Operations started by local accounts, and the job queue that runs
//! deferred federation work.

mod account;
mod jobs;
mod relay;
mod status;

pub use account::AccountService;
pub use jobs::{Job, JobQueue, JobRunner, perform, poll_expiration_lock};
pub use relay::RelayService;
pub use status::{NewPoll, NewStatus, StatusService};
