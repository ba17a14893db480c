#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! The engine driver, broadcast hub, and scheduler that turn submitted
//! analysis jobs into running UCI engine subprocesses and streamed updates.

pub mod driver;
pub mod hub;
pub mod scheduler;

pub use driver::{CancelToken, DriverUpdate, EngineError, JobSpec};
pub use hub::{ClientId, ClientSet, ClientSink};
pub use scheduler::{Scheduler, SchedulerConfig};
