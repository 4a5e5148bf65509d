//! Domain model (ids, tasks, schedules, packets, errors, events).

pub mod errors;
pub mod events;
pub mod identity;
pub mod ids;
pub mod packet;
pub mod schedule;
pub mod task;

pub use errors::{ErrorKind, ModelError};
pub use events::AuditEvent;
pub use ids::{CronJobId, PacketId, TaskId};
pub use packet::{CursoredPacket, Packet};
pub use schedule::{CronJob, DisabledReason, TaskSchedule};
pub use task::{
    CancelMeta, CancelSource, ModelUsage, Task, TaskProfile, TaskResult, TaskResultStatus,
    TaskStatus, TransitionError,
};
