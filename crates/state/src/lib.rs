//! Durable per-task state records.
//!
//! One JSON file per task id under the state directory. Updates are atomic
//! (write to a temp file, then rename) and serialized per record, so
//! concurrent workers can never interleave a read-modify-write. The
//! retention module sweeps aging records into the dated archive tree or
//! deletes them, keyed on their last status.

pub mod record;
pub mod retention;
pub mod store;

pub use record::{HistoryEntry, StateDelta, TaskState, TaskStateSummary};
pub use retention::{read_archived, ArchiveInfo};
pub use store::StateStore;
