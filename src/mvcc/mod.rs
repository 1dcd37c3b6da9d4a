// # MVCC Tuple Visibility
//
// Snapshot-based multi-version concurrency control:
//
// | Module | Responsibility |
// |--------|----------------|
// | [`tuple`] | Heap tuple headers and atomic hint bits |
// | [`snapshot`] | Snapshot type and registry-walking acquisition |
// | [`visibility`] | The satisfies-* predicate family |

pub mod snapshot;
pub mod tuple;
pub mod visibility;

pub use snapshot::{snapshot_data, DirtySnapshot, Snapshot};
pub use tuple::{infomask, HeapTupleHeader};
pub use visibility::{
    satisfies_dirty, satisfies_now, satisfies_self, satisfies_snapshot, satisfies_update,
    satisfies_vacuum, TupleUpdateStatus, VacuumStatus, VisibilityContext,
};
