//! Repository traits for metadata operations.

pub mod files;
pub mod ledger;
pub mod locks;
pub mod tasks;

pub use files::FileRepo;
pub use ledger::LedgerRepo;
pub use locks::LockRepo;
pub use tasks::TaskRepo;
