use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::result::Error as DieselError;
use diesel::sql_query;
use diesel::sql_types::{BigInt, Bool, Integer, Text};
use diesel::sqlite::SqliteConnection;
use uuid::Uuid;

use super::types::{
    decode_fixed_hex, DevEui, FragmentationSession, FuotaStoreError, MulticastSetup, RemoteState,
    Timestamp,
};

#[doc(hidden)]
#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct SessionRow {
    #[diesel(sql_type = Text)]
    pub dev_eui: String,
    #[diesel(sql_type = Integer)]
    pub frag_index: i32,
    #[diesel(sql_type = Integer)]
    pub nb_frag: i32,
    #[diesel(sql_type = Integer)]
    pub frag_size: i32,
    #[diesel(sql_type = Integer)]
    pub fragmentation_matrix: i32,
    #[diesel(sql_type = Integer)]
    pub block_ack_delay: i32,
    #[diesel(sql_type = Integer)]
    pub padding: i32,
    #[diesel(sql_type = Text)]
    pub descriptor: String,
    #[diesel(sql_type = Text)]
    pub state: String,
    #[diesel(sql_type = Bool)]
    pub state_provisioned: bool,
    #[diesel(sql_type = BigInt)]
    pub retry_after: i64,
    #[diesel(sql_type = Integer)]
    pub retry_count: i32,
    #[diesel(sql_type = BigInt)]
    pub created_at: i64,
    #[diesel(sql_type = BigInt)]
    pub updated_at: i64,
}

#[doc(hidden)]
#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct SessionGroupRow {
    #[diesel(sql_type = Text)]
    pub dev_eui: String,
    #[diesel(sql_type = Integer)]
    pub frag_index: i32,
    #[diesel(sql_type = Integer)]
    pub mc_group_id: i32,
}

#[doc(hidden)]
#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct MulticastSetupRow {
    #[diesel(sql_type = Text)]
    pub dev_eui: String,
    #[diesel(sql_type = Text)]
    pub multicast_group_id: String,
    #[diesel(sql_type = Integer)]
    pub mc_group_id: i32,
    #[diesel(sql_type = Text)]
    pub mc_addr: String,
    #[diesel(sql_type = Text)]
    pub mc_key_encrypted: String,
    #[diesel(sql_type = BigInt)]
    pub min_mc_fcnt: i64,
    #[diesel(sql_type = BigInt)]
    pub max_mc_fcnt: i64,
    #[diesel(sql_type = Text)]
    pub state: String,
    #[diesel(sql_type = Bool)]
    pub state_provisioned: bool,
    #[diesel(sql_type = BigInt)]
    pub retry_after: i64,
    #[diesel(sql_type = Integer)]
    pub retry_count: i32,
    #[diesel(sql_type = BigInt)]
    pub created_at: i64,
    #[diesel(sql_type = BigInt)]
    pub updated_at: i64,
}

#[doc(hidden)]
#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct CountRow {
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

/// How a backend keeps two workers off the same row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStrategy {
    /// Row locks held until the caller's transaction ends; contended rows are skipped.
    SkipLocked,
    /// `lease_owner`/`lease_expires_at` columns claimed by a conditional update.
    Optimistic,
}

impl LeaseStrategy {
    pub(crate) fn row_lock_clause(self, for_update: bool) -> &'static str {
        match (self, for_update) {
            (LeaseStrategy::SkipLocked, true) => " FOR UPDATE",
            _ => "",
        }
    }

    /// Extra `SET` assignments that hand a leased row back when its outcome is recorded.
    pub(crate) fn release_assignments(self) -> &'static str {
        match self {
            LeaseStrategy::SkipLocked => "",
            LeaseStrategy::Optimistic => ", lease_owner = NULL, lease_expires_at = NULL",
        }
    }
}

#[doc(hidden)]
pub trait FuotaDb: Sized {
    fn lease_strategy(&self) -> LeaseStrategy;
    fn execute_sql(&mut self, sql: &str) -> Result<usize, DieselError>;
    fn load_sessions(&mut self, sql: &str) -> Result<Vec<SessionRow>, DieselError>;
    fn load_session_groups(&mut self, sql: &str) -> Result<Vec<SessionGroupRow>, DieselError>;
    fn load_multicast_setups(&mut self, sql: &str) -> Result<Vec<MulticastSetupRow>, DieselError>;
    fn load_counts(&mut self, sql: &str) -> Result<Vec<CountRow>, DieselError>;

    /// Runs `f` in a transaction, or in a savepoint when the caller already opened one.
    fn atomically<T, F>(&mut self, f: F) -> Result<T, FuotaStoreError>
    where
        F: FnOnce(&mut Self) -> Result<T, FuotaStoreError>;
}

impl FuotaDb for PgConnection {
    fn lease_strategy(&self) -> LeaseStrategy {
        LeaseStrategy::SkipLocked
    }

    fn execute_sql(&mut self, sql: &str) -> Result<usize, DieselError> {
        sql_query(sql).execute(self)
    }

    fn load_sessions(&mut self, sql: &str) -> Result<Vec<SessionRow>, DieselError> {
        sql_query(sql).load::<SessionRow>(self)
    }

    fn load_session_groups(&mut self, sql: &str) -> Result<Vec<SessionGroupRow>, DieselError> {
        sql_query(sql).load::<SessionGroupRow>(self)
    }

    fn load_multicast_setups(&mut self, sql: &str) -> Result<Vec<MulticastSetupRow>, DieselError> {
        sql_query(sql).load::<MulticastSetupRow>(self)
    }

    fn load_counts(&mut self, sql: &str) -> Result<Vec<CountRow>, DieselError> {
        sql_query(sql).load::<CountRow>(self)
    }

    fn atomically<T, F>(&mut self, f: F) -> Result<T, FuotaStoreError>
    where
        F: FnOnce(&mut Self) -> Result<T, FuotaStoreError>,
    {
        self.transaction(f)
    }
}

impl FuotaDb for SqliteConnection {
    fn lease_strategy(&self) -> LeaseStrategy {
        LeaseStrategy::Optimistic
    }

    fn execute_sql(&mut self, sql: &str) -> Result<usize, DieselError> {
        sql_query(sql).execute(self)
    }

    fn load_sessions(&mut self, sql: &str) -> Result<Vec<SessionRow>, DieselError> {
        sql_query(sql).load::<SessionRow>(self)
    }

    fn load_session_groups(&mut self, sql: &str) -> Result<Vec<SessionGroupRow>, DieselError> {
        sql_query(sql).load::<SessionGroupRow>(self)
    }

    fn load_multicast_setups(&mut self, sql: &str) -> Result<Vec<MulticastSetupRow>, DieselError> {
        sql_query(sql).load::<MulticastSetupRow>(self)
    }

    fn load_counts(&mut self, sql: &str) -> Result<Vec<CountRow>, DieselError> {
        sql_query(sql).load::<CountRow>(self)
    }

    fn atomically<T, F>(&mut self, f: F) -> Result<T, FuotaStoreError>
    where
        F: FnOnce(&mut Self) -> Result<T, FuotaStoreError>,
    {
        self.transaction(f)
    }
}

pub(crate) fn map_session_row(
    row: SessionRow,
    mc_group_ids: Vec<i32>,
) -> Result<FragmentationSession, FuotaStoreError> {
    Ok(FragmentationSession {
        dev_eui: decode_dev_eui(&row.dev_eui)?,
        frag_index: row.frag_index,
        mc_group_ids,
        nb_frag: row.nb_frag,
        frag_size: row.frag_size,
        fragmentation_matrix: row.fragmentation_matrix,
        block_ack_delay: row.block_ack_delay,
        padding: row.padding,
        descriptor: decode_column::<4>("descriptor", &row.descriptor)?,
        state: RemoteState::from_db_str(&row.state)?,
        state_provisioned: row.state_provisioned,
        retry_after: Timestamp::from_unix_millis(row.retry_after),
        retry_count: row.retry_count,
        created_at: Timestamp::from_unix_millis(row.created_at),
        updated_at: Timestamp::from_unix_millis(row.updated_at),
    })
}

pub(crate) fn map_multicast_setup_row(
    row: MulticastSetupRow,
) -> Result<MulticastSetup, FuotaStoreError> {
    let multicast_group_id =
        Uuid::parse_str(&row.multicast_group_id).map_err(|_| FuotaStoreError::InvalidStoredValue {
            column: "multicast_group_id",
            value: row.multicast_group_id.clone(),
        })?;

    Ok(MulticastSetup {
        dev_eui: decode_dev_eui(&row.dev_eui)?,
        multicast_group_id,
        mc_group_id: row.mc_group_id,
        mc_addr: decode_column::<4>("mc_addr", &row.mc_addr)?,
        mc_key_encrypted: decode_column::<16>("mc_key_encrypted", &row.mc_key_encrypted)?,
        min_mc_fcnt: decode_fcnt("min_mc_fcnt", row.min_mc_fcnt)?,
        max_mc_fcnt: decode_fcnt("max_mc_fcnt", row.max_mc_fcnt)?,
        state: RemoteState::from_db_str(&row.state)?,
        state_provisioned: row.state_provisioned,
        retry_after: Timestamp::from_unix_millis(row.retry_after),
        retry_count: row.retry_count,
        created_at: Timestamp::from_unix_millis(row.created_at),
        updated_at: Timestamp::from_unix_millis(row.updated_at),
    })
}

fn decode_dev_eui(value: &str) -> Result<DevEui, FuotaStoreError> {
    decode_column::<8>("dev_eui", value).map(DevEui)
}

fn decode_column<const N: usize>(
    column: &'static str,
    value: &str,
) -> Result<[u8; N], FuotaStoreError> {
    decode_fixed_hex::<N>(value).ok_or_else(|| FuotaStoreError::InvalidStoredValue {
        column,
        value: value.to_string(),
    })
}

fn decode_fcnt(column: &'static str, value: i64) -> Result<u32, FuotaStoreError> {
    u32::try_from(value).map_err(|_| FuotaStoreError::InvalidStoredValue {
        column,
        value: value.to_string(),
    })
}

pub(crate) fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub(crate) fn quote_hex(bytes: &[u8]) -> String {
    quote(&hex::encode(bytes))
}

pub(crate) fn sql_bool(value: bool) -> &'static str {
    if value {
        "TRUE"
    } else {
        "FALSE"
    }
}
