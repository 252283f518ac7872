//! Domain model (IDs, payloads, status, records, progress, events, errors).

pub mod errors;
pub mod events;
pub mod ids;
pub mod payload;
pub mod progress;
pub mod record;
pub mod status;

pub use self::errors::{Result, StoreError, TankobonError};
pub use self::events::TaskEvent;
pub use self::ids::{ChapterId, ProfileId, TaskId};
pub use self::payload::{
    IntegrityCheckPayload, Lane, LibraryScanPayload, RenamePayload, RepairPayload, TaskKind,
    TaskPayload, UpscalePayload,
};
pub use self::progress::{ProgressHandle, ProgressUpdate, TaskProgress};
pub use self::record::TaskRecord;
pub use self::status::{QueueCounts, TaskStatus};
