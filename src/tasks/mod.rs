//! Task execution: commands, their callback context, capability tokens and
//! the scheduler driving them.

pub mod command;
pub mod context;
pub mod scheduler;
pub mod token;

pub use command::{Cancellable, TaskCommand};
pub use context::{ProvisionedProxy, TaskContext};
pub use scheduler::{RetryPolicy, TaskScheduler};
pub use token::{TaskClaims, TaskTokens};
