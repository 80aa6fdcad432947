// ABOUTME: Task state machine, dispatcher and stale-task sweeper
// ABOUTME: Owns every task status change after creation

pub mod collaborators;
pub mod dispatcher;
pub mod error;
pub mod service;
pub mod sweeper;
pub mod types;

pub use collaborators::{
    CredentialProvider, FileResolver, NoopCredentialProvider, NoopFileResolver,
};
pub use dispatcher::TaskDispatcher;
pub use error::{Result, TaskError};
pub use service::{ReconcileReport, TaskDomainService};
pub use sweeper::{StaleTaskSweeper, SweepReport};
pub use types::{Instruction, TaskRequest};
