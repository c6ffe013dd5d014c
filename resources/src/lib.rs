//! A simple crate providing shared resource loading features.
//!
//! A generic, robust and efficient crate providing features dedicated to:
//! - loading named byte-blob resources from a backing store at most once while they are in use,
//! - sharing and reference-counting them across concurrent requesters,
//! - managing generic blocking tasks on a fixed pool of worker threads.
//!
//! Resource entries are cached within an in-memory hashmap protected by a single `Mutex`, with the resource name as
//! the key and a slot as the value. A slot is either being loaded by one caller, in which case other callers for the
//! same name wait on a `Condvar` for it to settle instead of reading the store again, or ready with its immutable
//! payload and its reference count. The lock is never held while reading the store, so that different names are
//! served in parallel. An entry is removed within the same critical section that drops its count to zero, so no
//! entry is ever observable without a holder.
//!
//! Blocking reads are offloaded to a [`task::Pool`] of OS threads sharing an unbounded `mpsc` queue, each task
//! reporting its result, or its panic, through a one-shot [`task::Handle`] that can be read synchronously or awaited.
//!
//! ```text
//!     caller ── load_resource ──> ResourceCache ── entries: name -> Loading | Ready(payload, refcount)
//!                                       │
//!                                       └── read ──> Pool ── worker 0..N ──> BackingStore (root/path)
//! ```

pub mod cache;
pub mod task;
