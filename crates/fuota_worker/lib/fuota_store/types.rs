use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::{Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// Lease lifetime used when a backend has no native row locks.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// Highest multicast group slot a device exposes.
pub const MAX_MC_GROUP_ID: i32 = 3;

/// Error type for fragmentation-session and multicast-setup storage operations.
#[derive(Debug, Error)]
pub enum FuotaStoreError {
    #[error("object does not exist: {0}")]
    NotFound(String),
    #[error("object already exists: {0}")]
    AlreadyExists(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("transient storage error: {0}")]
    TransientStorage(#[source] DieselError),
    #[error("database operation failed: {0}")]
    Database(#[source] DieselError),
    #[error("invalid {column} value in database: {value}")]
    InvalidStoredValue { column: &'static str, value: String },
}

impl FuotaStoreError {
    /// True when the caller may repeat the exact same call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStorage(_))
    }
}

impl From<DieselError> for FuotaStoreError {
    fn from(err: DieselError) -> Self {
        if let DieselError::DatabaseError(kind, info) = &err {
            let message = info.message().to_string();
            match kind {
                DatabaseErrorKind::UniqueViolation => return Self::AlreadyExists(message),
                DatabaseErrorKind::CheckViolation
                | DatabaseErrorKind::NotNullViolation
                | DatabaseErrorKind::ForeignKeyViolation => {
                    return Self::ConstraintViolation(message)
                }
                _ => {}
            }
        }

        if is_transient(&err) {
            Self::TransientStorage(err)
        } else {
            Self::Database(err)
        }
    }
}

fn is_transient(err: &DieselError) -> bool {
    match err {
        DieselError::DatabaseError(kind, info) => match kind {
            DatabaseErrorKind::SerializationFailure
            | DatabaseErrorKind::UnableToSendCommand
            | DatabaseErrorKind::ClosedConnection => true,
            _ => is_lock_wait_message(info.message()),
        },
        _ => false,
    }
}

/// Lock-wait failures surface as unclassified errors in both backends.
fn is_lock_wait_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("lock timeout")
        || message.contains("deadlock detected")
        || message.contains("database is locked")
        || message.contains("database table is locked")
}

/// Opaque 8-byte end-device identifier, owned by the external device registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevEui(pub [u8; 8]);

impl DevEui {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Stable seed derived from the identifier, used for per-device jitter.
    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl fmt::Display for DevEui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for DevEui {
    type Err = FuotaStoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        decode_fixed_hex::<8>(value)
            .map(DevEui)
            .ok_or_else(|| {
                FuotaStoreError::ConstraintViolation(format!(
                    "dev_eui must be 16 hex characters, got {value:?}"
                ))
            })
    }
}

impl Serialize for DevEui {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// UTC instant with millisecond precision, persisted as milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(after) => Self(duration_millis(after)),
            Err(before) => Self(duration_millis(before.duration()).saturating_neg()),
        }
    }

    pub const fn from_unix_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub const fn as_unix_millis(self) -> i64 {
        self.0
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_millis(duration)))
    }

    pub fn saturating_sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_millis(duration)))
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Requested state of a remote (on-device) setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    /// Establish the session or group membership on the device.
    Setup,
    /// Tear it down again.
    Delete,
}

impl RemoteState {
    pub(crate) fn as_db_str(self) -> &'static str {
        match self {
            RemoteState::Setup => "setup",
            RemoteState::Delete => "delete",
        }
    }

    pub(crate) fn from_db_str(value: &str) -> Result<Self, FuotaStoreError> {
        match value {
            "setup" => Ok(RemoteState::Setup),
            "delete" => Ok(RemoteState::Delete),
            other => Err(FuotaStoreError::InvalidStoredValue {
                column: "state",
                value: other.to_string(),
            }),
        }
    }
}

/// Materialized row from `remote_fragmentation_session` plus its multicast group references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FragmentationSession {
    pub dev_eui: DevEui,
    pub frag_index: i32,
    /// Multicast group slots the fragments are delivered over. Empty means unicast.
    pub mc_group_ids: Vec<i32>,
    pub nb_frag: i32,
    pub frag_size: i32,
    pub fragmentation_matrix: i32,
    pub block_ack_delay: i32,
    pub padding: i32,
    #[serde(serialize_with = "serialize_hex")]
    pub descriptor: [u8; 4],
    pub state: RemoteState,
    pub state_provisioned: bool,
    pub retry_after: Timestamp,
    pub retry_count: i32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl FragmentationSession {
    /// Builds a session in `Setup` state that is due immediately.
    pub fn new(dev_eui: DevEui, frag_index: i32) -> Self {
        Self {
            dev_eui,
            frag_index,
            mc_group_ids: Vec::new(),
            nb_frag: 1,
            frag_size: 1,
            fragmentation_matrix: 0,
            block_ack_delay: 0,
            padding: 0,
            descriptor: [0; 4],
            state: RemoteState::Setup,
            state_provisioned: false,
            retry_after: Timestamp::now(),
            retry_count: 0,
            created_at: Timestamp::default(),
            updated_at: Timestamp::default(),
        }
    }

    /// Rejects values the radio layer cannot encode before anything reaches storage.
    pub(crate) fn validate(&self) -> Result<(), FuotaStoreError> {
        check_range("frag_index", self.frag_index, 0, i32::MAX)?;
        check_range("nb_frag", self.nb_frag, 1, i32::MAX)?;
        check_range("frag_size", self.frag_size, 1, i32::MAX)?;
        check_range("fragmentation_matrix", self.fragmentation_matrix, 0, 7)?;
        check_range("block_ack_delay", self.block_ack_delay, 0, i32::MAX)?;
        check_range("padding", self.padding, 0, i32::MAX)?;
        check_range("retry_count", self.retry_count, 0, i32::MAX)?;

        let mut seen = [false; (MAX_MC_GROUP_ID + 1) as usize];
        for &mc_group_id in &self.mc_group_ids {
            check_range("mc_group_ids", mc_group_id, 0, MAX_MC_GROUP_ID)?;
            let slot = &mut seen[mc_group_id as usize];
            if *slot {
                return Err(FuotaStoreError::ConstraintViolation(format!(
                    "mc_group_ids contains {mc_group_id} more than once"
                )));
            }
            *slot = true;
        }

        Ok(())
    }

    pub(crate) fn describe_key(&self) -> String {
        describe_session_key(&self.dev_eui, self.frag_index)
    }
}

/// Materialized row from `remote_multicast_setup`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastSetup {
    pub dev_eui: DevEui,
    /// External multicast group entity this membership belongs to.
    pub multicast_group_id: Uuid,
    /// Group slot on the device, referenced by `FragmentationSession::mc_group_ids`.
    pub mc_group_id: i32,
    pub mc_addr: [u8; 4],
    pub mc_key_encrypted: [u8; 16],
    pub min_mc_fcnt: u32,
    pub max_mc_fcnt: u32,
    pub state: RemoteState,
    pub state_provisioned: bool,
    pub retry_after: Timestamp,
    pub retry_count: i32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl MulticastSetup {
    /// Builds a membership in `Setup` state that is due immediately.
    pub fn new(dev_eui: DevEui, multicast_group_id: Uuid, mc_group_id: i32) -> Self {
        Self {
            dev_eui,
            multicast_group_id,
            mc_group_id,
            mc_addr: [0; 4],
            mc_key_encrypted: [0; 16],
            min_mc_fcnt: 0,
            max_mc_fcnt: u32::MAX,
            state: RemoteState::Setup,
            state_provisioned: false,
            retry_after: Timestamp::now(),
            retry_count: 0,
            created_at: Timestamp::default(),
            updated_at: Timestamp::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), FuotaStoreError> {
        check_range("mc_group_id", self.mc_group_id, 0, MAX_MC_GROUP_ID)?;
        check_range("retry_count", self.retry_count, 0, i32::MAX)?;
        if self.min_mc_fcnt > self.max_mc_fcnt {
            return Err(FuotaStoreError::ConstraintViolation(format!(
                "min_mc_fcnt ({}) must be <= max_mc_fcnt ({})",
                self.min_mc_fcnt, self.max_mc_fcnt
            )));
        }
        Ok(())
    }

    pub(crate) fn describe_key(&self) -> String {
        describe_multicast_key(&self.dev_eui, &self.multicast_group_id)
    }
}

/// Knobs for one pending-work selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOptions {
    /// Rows with `retry_after <= now` are due.
    pub now: Timestamp,
    /// Lease lifetime on backends that lease through columns instead of row locks.
    pub lease_ttl: Duration,
}

impl Default for PendingOptions {
    fn default() -> Self {
        Self {
            now: Timestamp::now(),
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

pub(crate) fn describe_session_key(dev_eui: &DevEui, frag_index: i32) -> String {
    format!("fragmentation session (dev_eui={dev_eui}, frag_index={frag_index})")
}

pub(crate) fn describe_multicast_key(dev_eui: &DevEui, multicast_group_id: &Uuid) -> String {
    format!("multicast setup (dev_eui={dev_eui}, multicast_group_id={multicast_group_id})")
}

pub(crate) fn decode_fixed_hex<const N: usize>(value: &str) -> Option<[u8; N]> {
    let mut out = [0u8; N];
    hex::decode_to_slice(value, &mut out).ok()?;
    Some(out)
}

fn check_range(field: &str, value: i32, min: i32, max: i32) -> Result<(), FuotaStoreError> {
    if value < min || value > max {
        return Err(FuotaStoreError::ConstraintViolation(format!(
            "{field} must be in [{min}, {max}], got {value}"
        )));
    }
    Ok(())
}

fn serialize_hex<S: Serializer>(bytes: &[u8; 4], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}
