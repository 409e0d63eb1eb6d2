//! Lease-based selection of due work.
//!
//! A selection is one filtering statement: due (`retry_after <= now`), under the retry budget
//! (`retry_count < max_retry_count`) and, for sessions, with every referenced multicast slot
//! provisioned. Rows come back oldest-due first with the primary key as tie-break.
//!
//! Each returned row is leased to the caller:
//! - Postgres locks the rows with `FOR UPDATE ... SKIP LOCKED`. Concurrent selections skip
//!   locked rows instead of waiting on them, and the lease ends with the caller's transaction.
//! - SQLite has no row locks, so one conditional `UPDATE` stamps a fresh `lease_owner` and
//!   `lease_expires_at` on the eligible, unleased rows and the batch is read back by owner.
//!   The lease ends on rollback, when `update`/`delete` records the outcome, or on expiry.
//!
//! SQLite allows one writer per database file. Call the selector there in autocommit mode: the
//! claim then commits as one short write, the lease outlives it, and a concurrent selection on
//! another connection waits at most for that single statement before it gets the remaining
//! rows. A caller that selects inside its own transaction holds the write lock until that
//! transaction ends. Selections on other connections then wait up to the busy timeout and fail
//! with the retryable `TransientStorage`. Postgres has no such restriction.

use diesel::result::Error as DieselError;
use tracing::debug;
use uuid::Uuid;

use super::fragmentation_session::{attach_group_ids, SESSION_COLUMNS, SESSION_ORDER};
use super::multicast_setup::{MULTICAST_SETUP_COLUMNS, MULTICAST_SETUP_ORDER};
use super::store::{map_multicast_setup_row, quote, FuotaDb, LeaseStrategy};
use super::types::{
    FragmentationSession, FuotaStoreError, MulticastSetup, PendingOptions, Timestamp,
};

/// One leasable work table.
struct LeaseScan {
    table: &'static str,
    key_columns: &'static str,
    aliased_key_columns: &'static str,
    columns: &'static str,
    order_by: &'static str,
}

const SESSION_SCAN: LeaseScan = LeaseScan {
    table: "remote_fragmentation_session",
    key_columns: "dev_eui, frag_index",
    aliased_key_columns: "s.dev_eui, s.frag_index",
    columns: SESSION_COLUMNS,
    order_by: SESSION_ORDER,
};

const MULTICAST_SETUP_SCAN: LeaseScan = LeaseScan {
    table: "remote_multicast_setup",
    key_columns: "dev_eui, multicast_group_id",
    aliased_key_columns: "s.dev_eui, s.multicast_group_id",
    columns: MULTICAST_SETUP_COLUMNS,
    order_by: MULTICAST_SETUP_ORDER,
};

/// Leases up to `limit` due, dependency-satisfied, non-exhausted fragmentation sessions.
///
/// Uses the current time and the default lease TTL. `limit <= 0` or an empty match returns an
/// empty batch. Sessions waiting on an unprovisioned (or missing) multicast slot are skipped
/// without touching their `retry_count`.
pub fn get_pending_fragmentation_sessions<C>(
    conn: &mut C,
    limit: i64,
    max_retry_count: i32,
) -> Result<Vec<FragmentationSession>, FuotaStoreError>
where
    C: FuotaDb,
{
    get_pending_fragmentation_sessions_with(
        conn,
        limit,
        max_retry_count,
        &PendingOptions::default(),
    )
}

/// [`get_pending_fragmentation_sessions`] with an explicit clock and lease TTL.
pub fn get_pending_fragmentation_sessions_with<C>(
    conn: &mut C,
    limit: i64,
    max_retry_count: i32,
    options: &PendingOptions,
) -> Result<Vec<FragmentationSession>, FuotaStoreError>
where
    C: FuotaDb,
{
    if limit <= 0 {
        return Ok(Vec::new());
    }

    let filter = session_eligibility_filter(options.now, max_retry_count);
    let rows = select_leased(conn, &SESSION_SCAN, &filter, limit, options, C::load_sessions)?;
    let sessions = attach_group_ids(conn, rows)?;

    debug!(
        event = "pending_fragmentation_sessions_selected",
        count = sessions.len(),
        limit,
        max_retry_count,
        strategy = ?conn.lease_strategy(),
        "selected pending fragmentation sessions"
    );
    Ok(sessions)
}

/// Same filter and ordering as the selector, but reads without leasing anything.
pub fn list_pending_fragmentation_sessions<C>(
    conn: &mut C,
    limit: i64,
    max_retry_count: i32,
    now: Timestamp,
) -> Result<Vec<FragmentationSession>, FuotaStoreError>
where
    C: FuotaDb,
{
    if limit <= 0 {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT {} FROM {} s WHERE {} ORDER BY {} LIMIT {limit}",
        SESSION_SCAN.columns,
        SESSION_SCAN.table,
        session_eligibility_filter(now, max_retry_count),
        SESSION_SCAN.order_by,
    );
    let rows = conn.load_sessions(&sql)?;
    attach_group_ids(conn, rows)
}

/// Leases up to `limit` due, non-exhausted multicast setups.
pub fn get_pending_multicast_setups<C>(
    conn: &mut C,
    limit: i64,
    max_retry_count: i32,
) -> Result<Vec<MulticastSetup>, FuotaStoreError>
where
    C: FuotaDb,
{
    get_pending_multicast_setups_with(conn, limit, max_retry_count, &PendingOptions::default())
}

/// [`get_pending_multicast_setups`] with an explicit clock and lease TTL.
pub fn get_pending_multicast_setups_with<C>(
    conn: &mut C,
    limit: i64,
    max_retry_count: i32,
    options: &PendingOptions,
) -> Result<Vec<MulticastSetup>, FuotaStoreError>
where
    C: FuotaDb,
{
    if limit <= 0 {
        return Ok(Vec::new());
    }

    let filter = due_filter(options.now, max_retry_count);
    let setups = select_leased(
        conn,
        &MULTICAST_SETUP_SCAN,
        &filter,
        limit,
        options,
        C::load_multicast_setups,
    )?
    .into_iter()
    .map(map_multicast_setup_row)
    .collect::<Result<Vec<_>, _>>()?;

    debug!(
        event = "pending_multicast_setups_selected",
        count = setups.len(),
        limit,
        max_retry_count,
        strategy = ?conn.lease_strategy(),
        "selected pending multicast setups"
    );
    Ok(setups)
}

fn due_filter(now: Timestamp, max_retry_count: i32) -> String {
    format!(
        "s.retry_after <= {} AND s.retry_count < {max_retry_count}",
        now.as_unix_millis()
    )
}

/// Due and not exhausted, and no referenced slot lacks a provisioned multicast setup.
fn session_eligibility_filter(now: Timestamp, max_retry_count: i32) -> String {
    format!(
        "{} AND NOT EXISTS ( \
             SELECT 1 FROM remote_fragmentation_session_mc_group g \
             WHERE g.dev_eui = s.dev_eui \
               AND g.frag_index = s.frag_index \
               AND NOT EXISTS ( \
                   SELECT 1 FROM remote_multicast_setup m \
                   WHERE m.dev_eui = g.dev_eui \
                     AND m.mc_group_id = g.mc_group_id \
                     AND m.state_provisioned = TRUE \
               ) \
         )",
        due_filter(now, max_retry_count)
    )
}

fn select_leased<C, R, L>(
    conn: &mut C,
    scan: &LeaseScan,
    filter: &str,
    limit: i64,
    options: &PendingOptions,
    load: L,
) -> Result<Vec<R>, FuotaStoreError>
where
    C: FuotaDb,
    L: Fn(&mut C, &str) -> Result<Vec<R>, DieselError>,
{
    match conn.lease_strategy() {
        LeaseStrategy::SkipLocked => {
            let sql = format!(
                "SELECT {} FROM {} s WHERE {filter} ORDER BY {} LIMIT {limit} \
                 FOR UPDATE OF s SKIP LOCKED",
                scan.columns, scan.table, scan.order_by,
            );
            Ok(load(conn, &sql)?)
        }
        LeaseStrategy::Optimistic => {
            let owner = quote(&Uuid::new_v4().to_string());
            let now = options.now.as_unix_millis();
            let expires_at = options.now.saturating_add(options.lease_ttl).as_unix_millis();

            let claim_sql = format!(
                "UPDATE {table} \
                 SET lease_owner = {owner}, lease_expires_at = {expires_at} \
                 WHERE ({keys}) IN ( \
                     SELECT {aliased_keys} FROM {table} s \
                     WHERE {filter} \
                       AND (s.lease_owner IS NULL OR s.lease_expires_at <= {now}) \
                     ORDER BY {order_by} \
                     LIMIT {limit} \
                 )",
                table = scan.table,
                keys = scan.key_columns,
                aliased_keys = scan.aliased_key_columns,
                order_by = scan.order_by,
            );
            let sql = format!(
                "SELECT {} FROM {} s WHERE s.lease_owner = {owner} ORDER BY {}",
                scan.columns, scan.table, scan.order_by,
            );

            // Claim and read back in one write; outside a caller transaction it commits here.
            conn.atomically(|conn| {
                if conn.execute_sql(&claim_sql)? == 0 {
                    return Ok(Vec::new());
                }
                Ok(load(conn, &sql)?)
            })
        }
    }
}
