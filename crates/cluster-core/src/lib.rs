#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared job domain types, the UCI line parser, and the durable record store
//! for the chess analysis cluster server.

pub mod parser;
pub mod record;
pub mod store;

pub use parser::{parse_line, Fields, ParsedLine};
pub use record::{JobRecord, JobStatus, JobView, LimitType, PendingJob, ServerStatus};
pub use store::{Store, StoreError};
