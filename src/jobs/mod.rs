//! Job & Schedule Engine: persistent declarative backup jobs
//! with schedules, retention/persistence policy, mount orchestration,
//! slave pairing/dispatch, and a run-state machine.

pub mod config;
pub mod engine;
pub mod persistence;
pub mod running_info;
pub mod schedule;
pub mod schedule_info;
pub mod slave;
pub mod state;

pub use config::{ArchiveFileMode, CryptPasswordMode, CryptType, Job, JobOptions, RestoreEntryMode, SlaveHost};
pub use engine::{JobEngine, JobList, JobNode};
pub use persistence::PersistenceRule;
pub use running_info::RunningInfo;
pub use schedule::{DateField, Schedule, WeekdaySet};
pub use slave::SlaveNode;
pub use state::{CredentialKind, JobState, RunState, TransitionError};
