// SPDX-License-Identifier: MIT OR Apache-2.0
//! SQLite-backed storage: one database per project (`memory.db`), one
//! cross-project index (`index.db`), and the outbox's durable mirror
//! (`outbox.db`).
//!
//! Every store wraps its [`rusqlite::Connection`] in an `Arc<Mutex<_>>`,
//! applies `WAL`/`NORMAL`/busy-timeout pragmas on open, and runs its schema
//! migrations through a shared, idempotent `oc_meta.schema_version` gate —
//! migrating an already-current database is a no-op.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod global;
mod outbox;
mod project;
mod query;
mod schema;

pub use global::{Direction, GlobalIndex};
pub use ocmem_error::OcError;
pub use outbox::OutboxDb;
pub use project::ProjectStore;
pub use query::ObservationFilter;
