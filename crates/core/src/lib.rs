//! `backlog-core`: the queue's domain model.
//!
//! Job records, the payload codec, retry arithmetic and configuration. No
//! storage or runtime concerns live here beyond what payload execution needs.

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod id;
pub mod job;
pub mod payload;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{COMMAND_TYPE, CommandFn, EncodedPayload, PayloadRegistry};
pub use config::{DEFAULT_MAX_RUN_TIME, QueueConfig};
pub use error::{CodecError, ConfigError, ExecutionFault};
pub use id::{JobId, WorkerId};
pub use job::{DecodedPayload, Job, JobFilter, JobState, NewJob, format_last_error, lock_expiry_cutoff};
pub use payload::{Payload, PayloadType};
pub use retry::{DEFAULT_MAX_ATTEMPTS, RetryPolicy};
