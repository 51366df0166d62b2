pub mod error;
pub mod event;
pub mod record;
pub mod status;
pub mod types;

pub use error::CoreError;
pub use event::{SessionEvent, StoreEvent};
pub use record::SessionRecord;
pub use status::{ClientInfo, ClientSignal, ClientStatus};
pub use types::{ArchiveRef, DEFAULT_SESSION_ID, MAX_SESSION_ID_LEN, SessionId};
