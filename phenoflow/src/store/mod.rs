//! Transactional persistence seam.
//!
//! A [`Database`] hands out [`UnitOfWork`] sessions. Writes made through a
//! session become visible to other sessions only on `commit`; `rollback`
//! discards them. [`RecordStore`] layers typed access to task-run and
//! pipeline rows on top of the generic row API.

mod memory;
mod unit_of_work;

pub use memory::InMemoryDatabase;
pub use unit_of_work::{Database, RecordStore, UnitOfWork, PIPELINE_TABLE, TASK_RUN_TABLE};
