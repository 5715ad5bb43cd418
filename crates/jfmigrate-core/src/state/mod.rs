//! Run state persisted across interruptions.

mod atomic;
mod ledger;

pub use atomic::{atomic_read_json, atomic_write_json};
pub use ledger::{Ledger, LedgerEntry, Outcome};
