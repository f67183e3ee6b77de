//! Crawler core: pure task-scheduling state machine.
//!
//! Nothing in here performs IO. The engine feeds [`Msg`]s into [`update`] and
//! executes the returned [`Effect`]s.
mod effect;
mod msg;
mod state;
mod update;
mod view_model;

pub use effect::Effect;
pub use msg::{Msg, RunOutcome};
pub use state::{SchedulerState, Task, TaskId, TaskStatus, PROGRESS_CEILING};
pub use update::update;
pub use view_model::SchedulerView;
