//! Durable FUOTA work state: fragmentation sessions, multicast setups and the pending selector.
//!
//! Every operation is synchronous and takes the caller's connection, so callers decide the
//! transaction scope. Selections made inside a caller transaction keep their lease until that
//! transaction ends (Postgres) or until the outcome is recorded with `update`/`delete` (SQLite).
//!
//! Retry timing is the caller's business. The store persists `retry_after`/`retry_count` exactly
//! as given; see `crate::backoff` for helpers that compute them.

mod fragmentation_session;
mod multicast_setup;
mod pending;
mod store;
mod types;

pub use fragmentation_session::{
    create_fragmentation_session, delete_fragmentation_session, get_fragmentation_session,
    list_exhausted_fragmentation_sessions, update_fragmentation_session,
};
pub use multicast_setup::{
    create_multicast_setup, delete_multicast_setup, get_multicast_setup,
    get_multicast_setup_by_slot, list_multicast_setups_for_device, update_multicast_setup,
};
pub use pending::{
    get_pending_fragmentation_sessions, get_pending_fragmentation_sessions_with,
    get_pending_multicast_setups, get_pending_multicast_setups_with,
    list_pending_fragmentation_sessions,
};
pub use store::{FuotaDb, LeaseStrategy};
pub use types::{
    DevEui, FragmentationSession, FuotaStoreError, MulticastSetup, PendingOptions, RemoteState,
    Timestamp, DEFAULT_LEASE_TTL, MAX_MC_GROUP_ID,
};
