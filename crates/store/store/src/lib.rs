pub mod archive;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod store;
pub mod testing;

pub use archive::{
    ARCHIVE_KIND, ArchiveHeader, ArchiveStore, ArchiveStream, ArchiveUpload, DEFAULT_CHUNK_SIZE,
    StrayChunks, length_checked, read_chunk,
};
pub use error::{BlobError, LedgerError, PersistError};
pub use ledger::SessionLedger;
pub use lock::SessionLocks;
pub use store::{Inventory, SessionStore};
