//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID
//! すべての ID は `Id<T>` に包まれた ULID です。`T` はサイズ 0 のマーカー型で、
//! 実行時には存在しません（PhantomData）。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: 先頭 48 bit がタイムスタンプなので、同一プロセス内では生成順に並ぶ
//! - **128 bit**: `Id<T>` も `#[repr(transparent)]` で同じサイズ
//!
//! ## ID の種類
//! - `JobId`: AdmissionQueue 内の 1 エントリ（表示プレフィックス `job-`）
//! - `TaskUuid`: RetryableTask の 1 インスタンス（表示プレフィックス `task-`）。
//!   ポーリングでは同じ設定エントリから毎サイクル新しい `TaskUuid` が生成される
//!
//! serde ではプレフィックスなしの ULID 文字列としてシリアライズされます。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for id kinds.
///
/// Supplies the prefix used by `Display` ("job-", "task-").
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id.
///
/// `T` only exists at compile time, so a `JobId` can never be passed where a
/// `TaskUuid` is expected.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Generate a fresh id from the current time and random bits.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Marker for admission queue entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

/// Marker for retryable task instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Identifier of one entry in an admission queue.
pub type JobId = Id<Job>;

/// Identifier of one retryable task instance (unique per schedule).
pub type TaskUuid = Id<Task>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        let job = JobId::generate();
        let task = TaskUuid::generate();

        assert!(job.to_string().starts_with("job-"));
        assert!(task.to_string().starts_with("task-"));
    }

    #[test]
    fn generated_ids_are_unique_and_sortable() {
        let id1 = TaskUuid::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = TaskUuid::generate();

        assert_ne!(id1, id2);
        assert!(id1 < id2);
    }

    #[test]
    fn ids_serialize_as_ulid() {
        let ulid = Ulid::new();
        let id: TaskUuid = ulid.into();

        let serialized = serde_json::to_string(&id).unwrap();
        assert_eq!(serialized, format!("\"{ulid}\""));
        let back: TaskUuid = serde_json::from_str(&serialized).unwrap();

        assert_eq!(back, id);
        assert_eq!(back.as_ulid(), ulid);
    }

    #[test]
    fn phantom_marker_costs_nothing() {
        use std::mem::size_of;
        assert_eq!(size_of::<JobId>(), size_of::<Ulid>());
        assert_eq!(size_of::<TaskUuid>(), 16);
    }
}
