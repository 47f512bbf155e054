//! Single-consumer task runners.
//!
//! A runner owns one thread that executes posted tasks, delayed tasks and
//! file descriptor watch callbacks. Any thread may post to it.
//!
//! ```no_run
//! use runloop::{LockFreeTaskRunner, RunLoop, Task, TaskRunner};
//!
//! # fn main() -> anyhow::Result<()> {
//! let runner = LockFreeTaskRunner::try_new()?;
//! let quit = runner.clone();
//! runner.post_task(Task::new(move || quit.quit()));
//! runner.run();
//! # Ok(())
//! # }
//! ```

mod error;
pub use error::RunnerError;

mod platform;

pub mod runner;
pub use runner::{
    Builder, LockFreeTaskRunner, RunLoop, RunnerConfig, TaskRunner, ThreadTaskRunner,
    UnixTaskRunner,
};

mod sync;

mod task;
pub use task::Task;

mod time;

mod utils;

mod watch;
pub use watch::WatchCallback;

#[cfg(test)]
mod test_utils;
