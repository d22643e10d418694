//! The versioned resource storage engine: bit-packed version tokens, the
//! `ResourceStore` operation contract and its in-memory implementation, code
//! interning, the LUID generator, and the bounded worker pool that fronts
//! writes.

pub mod error;
pub mod intern;
pub mod luid;
pub mod memory;
pub mod pool;
pub mod store;
pub mod version;

pub use error::{ConflictCause, Error, NotSupportedCause, Result};
pub use intern::{CodeInterner, CodeKey, Interned};
pub use luid::LuidGenerator;
pub use memory::InMemoryResourceStore;
pub use pool::WorkerPool;
pub use store::{apply_mutation, CasGuard, ElementPath, Mutation, ResourceStore, Segment, StoredResource, WriteRequest, WriteResult};
pub use version::{delete_decrement, initial, is_deleted, ordinal, upsert_decrement, CreationMode};
