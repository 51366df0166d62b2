mod archive;
mod ledger;

pub use archive::MemoryArchiveStore;
pub use ledger::MemorySessionLedger;
