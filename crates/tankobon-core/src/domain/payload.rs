//! Task payloads - タスク種別ごとのデータ
//!
//! `TaskPayload` は `kind` を判別子として永続化される tagged enum です。
//! キュー・コーディネーターが参照するのは `lane()` / `is_local_only()` /
//! `chapter_id()` だけなので、種別を追加しても両者は変更不要です。

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{ChapterId, ProfileId};

/// Logical sub-queue a task is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Everything that is not an upscale.
    Standard,
    /// Upscale work; may be delegated to remote workers.
    Upscale,
    /// Upscale-lane work that must run on this machine.
    Rerouted,
}

impl Lane {
    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Standard => "standard",
            Lane::Upscale => "upscale",
            Lane::Rerouted => "rerouted",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind discriminator, used as the handler registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Upscale,
    RepairUpscale,
    RenameUpscaled,
    LibraryScan,
    IntegrityCheck,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        TaskKind::Upscale,
        TaskKind::RepairUpscale,
        TaskKind::RenameUpscaled,
        TaskKind::LibraryScan,
        TaskKind::IntegrityCheck,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Upscale => "upscale",
            TaskKind::RepairUpscale => "repair_upscale",
            TaskKind::RenameUpscaled => "rename_upscaled",
            TaskKind::LibraryScan => "library_scan",
            TaskKind::IntegrityCheck => "integrity_check",
        }
    }

    /// Lane this kind is routed to on enqueue.
    pub fn lane(self) -> Lane {
        match self {
            TaskKind::Upscale | TaskKind::RepairUpscale | TaskKind::RenameUpscaled => Lane::Upscale,
            TaskKind::LibraryScan | TaskKind::IntegrityCheck => Lane::Standard,
        }
    }

    /// Upscale-lane kinds that must never be handed to a remote worker.
    pub fn is_local_only(self) -> bool {
        matches!(self, TaskKind::RenameUpscaled)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpscalePayload {
    pub chapter_id: ChapterId,
    pub profile_id: ProfileId,
}

/// Patch a previously upscaled archive instead of redoing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairPayload {
    pub chapter_id: ChapterId,
    pub profile_id: ProfileId,
}

/// Rename the upscaled copy of a chapter after its source was renamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamePayload {
    pub chapter_id: ChapterId,
    pub profile_id: ProfileId,
    pub new_file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryScanPayload {
    pub library_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityCheckPayload {
    pub library_id: i64,
}

/// Polymorphic task data, persisted with its `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    Upscale(UpscalePayload),
    RepairUpscale(RepairPayload),
    RenameUpscaled(RenamePayload),
    LibraryScan(LibraryScanPayload),
    IntegrityCheck(IntegrityCheckPayload),
}

impl TaskPayload {
    pub fn upscale(chapter_id: i64, profile_id: i64) -> Self {
        TaskPayload::Upscale(UpscalePayload {
            chapter_id: ChapterId(chapter_id),
            profile_id: ProfileId(profile_id),
        })
    }

    pub fn repair(chapter_id: i64, profile_id: i64) -> Self {
        TaskPayload::RepairUpscale(RepairPayload {
            chapter_id: ChapterId(chapter_id),
            profile_id: ProfileId(profile_id),
        })
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::Upscale(_) => TaskKind::Upscale,
            TaskPayload::RepairUpscale(_) => TaskKind::RepairUpscale,
            TaskPayload::RenameUpscaled(_) => TaskKind::RenameUpscaled,
            TaskPayload::LibraryScan(_) => TaskKind::LibraryScan,
            TaskPayload::IntegrityCheck(_) => TaskKind::IntegrityCheck,
        }
    }

    pub fn lane(&self) -> Lane {
        self.kind().lane()
    }

    pub fn is_local_only(&self) -> bool {
        self.kind().is_local_only()
    }

    /// Chapter the task refers to, if any.
    pub fn chapter_id(&self) -> Option<ChapterId> {
        match self {
            TaskPayload::Upscale(p) => Some(p.chapter_id),
            TaskPayload::RepairUpscale(p) => Some(p.chapter_id),
            TaskPayload::RenameUpscaled(p) => Some(p.chapter_id),
            TaskPayload::LibraryScan(_) | TaskPayload::IntegrityCheck(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::upscale(TaskKind::Upscale, Lane::Upscale, false)]
    #[case::repair(TaskKind::RepairUpscale, Lane::Upscale, false)]
    #[case::rename(TaskKind::RenameUpscaled, Lane::Upscale, true)]
    #[case::scan(TaskKind::LibraryScan, Lane::Standard, false)]
    #[case::integrity(TaskKind::IntegrityCheck, Lane::Standard, false)]
    fn kind_routing(#[case] kind: TaskKind, #[case] lane: Lane, #[case] local_only: bool) {
        assert_eq!(kind.lane(), lane);
        assert_eq!(kind.is_local_only(), local_only);
    }

    #[test]
    fn payload_is_persisted_with_kind_tag() {
        let payload = TaskPayload::upscale(7, 2);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "upscale");
        assert_eq!(json["chapter_id"], 7);
        assert_eq!(json["profile_id"], 2);

        let back: TaskPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn chapter_id_only_for_chapter_kinds() {
        assert_eq!(TaskPayload::repair(3, 1).chapter_id(), Some(ChapterId(3)));
        let scan = TaskPayload::LibraryScan(LibraryScanPayload { library_id: 1 });
        assert_eq!(scan.chapter_id(), None);
    }
}
