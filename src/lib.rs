pub mod advance;
pub mod cascade;
pub mod error;
pub mod health;
pub mod logging;
pub mod model;
pub mod registry;
pub mod reliability;
pub mod replication;
pub mod session;
pub mod slots;
pub mod state;
pub mod store;

pub use error::{StoreError, SyncError, SyncResult};
pub use session::{Confirmation, Session, Snapshot};
pub use state::Config;
