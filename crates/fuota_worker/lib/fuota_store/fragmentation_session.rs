use std::collections::HashMap;

use tracing::debug;

use super::store::{map_session_row, quote, quote_hex, sql_bool, FuotaDb, SessionRow};
use super::types::{describe_session_key, DevEui, FragmentationSession, FuotaStoreError, Timestamp};

/// Column list for `remote_fragmentation_session` aliased as `s`, in `SessionRow` order.
pub(crate) const SESSION_COLUMNS: &str = "s.dev_eui, s.frag_index, s.nb_frag, s.frag_size, \
     s.fragmentation_matrix, s.block_ack_delay, s.padding, s.descriptor, s.state, \
     s.state_provisioned, s.retry_after, s.retry_count, s.created_at, s.updated_at";

/// Oldest-due first, primary key as tie-break.
pub(crate) const SESSION_ORDER: &str = "s.retry_after ASC, s.dev_eui ASC, s.frag_index ASC";

/// Inserts a new fragmentation session and its multicast group references.
///
/// `created_at` and `updated_at` are assigned here and written back into `session`.
pub fn create_fragmentation_session<C>(
    conn: &mut C,
    session: &mut FragmentationSession,
) -> Result<(), FuotaStoreError>
where
    C: FuotaDb,
{
    session.validate()?;
    let now = Timestamp::now();

    {
        let record: &FragmentationSession = session;
        conn.atomically(|conn| {
            let insert_sql = format!(
                "INSERT INTO remote_fragmentation_session \
                 (dev_eui, frag_index, nb_frag, frag_size, fragmentation_matrix, block_ack_delay, \
                  padding, descriptor, state, state_provisioned, retry_after, retry_count, \
                  created_at, updated_at) \
                 VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {now_ms}, {now_ms}) \
                 ON CONFLICT DO NOTHING",
                quote(&record.dev_eui.to_hex()),
                record.frag_index,
                record.nb_frag,
                record.frag_size,
                record.fragmentation_matrix,
                record.block_ack_delay,
                record.padding,
                quote_hex(&record.descriptor),
                quote(record.state.as_db_str()),
                sql_bool(record.state_provisioned),
                record.retry_after.as_unix_millis(),
                record.retry_count,
                now_ms = now.as_unix_millis(),
            );
            if conn.execute_sql(&insert_sql)? == 0 {
                return Err(FuotaStoreError::AlreadyExists(record.describe_key()));
            }

            insert_group_rows(conn, &record.dev_eui, record.frag_index, &record.mc_group_ids)
        })?;
    }

    session.created_at = now;
    session.updated_at = now;

    debug!(
        event = "fragmentation_session_created",
        dev_eui = %session.dev_eui,
        frag_index = session.frag_index,
        mc_group_ids = ?session.mc_group_ids,
        "created fragmentation session"
    );
    Ok(())
}

/// Reads one fragmentation session.
///
/// With `for_update`, the row stays exclusively locked until the caller's transaction ends on
/// backends with row locks. SQLite serializes writers per database, so no clause is added there.
pub fn get_fragmentation_session<C>(
    conn: &mut C,
    dev_eui: &DevEui,
    frag_index: i32,
    for_update: bool,
) -> Result<FragmentationSession, FuotaStoreError>
where
    C: FuotaDb,
{
    let sql = format!(
        "SELECT {SESSION_COLUMNS} \
         FROM remote_fragmentation_session s \
         WHERE s.dev_eui = {} AND s.frag_index = {frag_index}{}",
        quote(&dev_eui.to_hex()),
        conn.lease_strategy().row_lock_clause(for_update),
    );

    let mut rows = conn.load_sessions(&sql)?;
    let Some(row) = rows.pop() else {
        return Err(FuotaStoreError::NotFound(describe_session_key(
            dev_eui, frag_index,
        )));
    };

    let mut sessions = attach_group_ids(conn, vec![row])?;
    sessions
        .pop()
        .ok_or_else(|| FuotaStoreError::NotFound(describe_session_key(dev_eui, frag_index)))
}

/// Replaces every mutable field of a session, including its multicast group references.
///
/// `retry_count` may never go backwards. On lease-column backends this also releases the
/// caller's lease, since recording an outcome is the end of the work item.
pub fn update_fragmentation_session<C>(
    conn: &mut C,
    session: &mut FragmentationSession,
) -> Result<(), FuotaStoreError>
where
    C: FuotaDb,
{
    session.validate()?;
    let now = Timestamp::now();
    let release = conn.lease_strategy().release_assignments();

    {
        let record: &FragmentationSession = session;
        conn.atomically(|conn| {
            let key = session_key_predicate(&record.dev_eui, record.frag_index);
            let update_sql = format!(
                "UPDATE remote_fragmentation_session \
                 SET nb_frag = {}, frag_size = {}, fragmentation_matrix = {}, \
                     block_ack_delay = {}, padding = {}, descriptor = {}, state = {}, \
                     state_provisioned = {}, retry_after = {}, retry_count = {}, \
                     updated_at = {}{release} \
                 WHERE {key} AND retry_count <= {}",
                record.nb_frag,
                record.frag_size,
                record.fragmentation_matrix,
                record.block_ack_delay,
                record.padding,
                quote_hex(&record.descriptor),
                quote(record.state.as_db_str()),
                sql_bool(record.state_provisioned),
                record.retry_after.as_unix_millis(),
                record.retry_count,
                now.as_unix_millis(),
                record.retry_count,
            );

            if conn.execute_sql(&update_sql)? == 0 {
                return Err(if session_exists(conn, &record.dev_eui, record.frag_index)? {
                    FuotaStoreError::ConstraintViolation(format!(
                        "retry_count of {} must not decrease below the stored value",
                        record.describe_key()
                    ))
                } else {
                    FuotaStoreError::NotFound(record.describe_key())
                });
            }

            conn.execute_sql(&format!(
                "DELETE FROM remote_fragmentation_session_mc_group WHERE {key}"
            ))?;
            insert_group_rows(conn, &record.dev_eui, record.frag_index, &record.mc_group_ids)
        })?;
    }

    session.updated_at = now;

    debug!(
        event = "fragmentation_session_updated",
        dev_eui = %session.dev_eui,
        frag_index = session.frag_index,
        state = session.state.as_db_str(),
        state_provisioned = session.state_provisioned,
        retry_count = session.retry_count,
        retry_after = session.retry_after.as_unix_millis(),
        "updated fragmentation session"
    );
    Ok(())
}

/// Removes a session and its multicast group references.
pub fn delete_fragmentation_session<C>(
    conn: &mut C,
    dev_eui: &DevEui,
    frag_index: i32,
) -> Result<(), FuotaStoreError>
where
    C: FuotaDb,
{
    let key = session_key_predicate(dev_eui, frag_index);

    conn.atomically(|conn| {
        conn.execute_sql(&format!(
            "DELETE FROM remote_fragmentation_session_mc_group WHERE {key}"
        ))?;
        let deleted = conn.execute_sql(&format!(
            "DELETE FROM remote_fragmentation_session WHERE {key}"
        ))?;
        if deleted == 0 {
            return Err(FuotaStoreError::NotFound(describe_session_key(
                dev_eui, frag_index,
            )));
        }
        Ok(())
    })?;

    debug!(
        event = "fragmentation_session_deleted",
        dev_eui = %dev_eui,
        frag_index,
        "deleted fragmentation session"
    );
    Ok(())
}

/// Lists sessions whose retry budget is spent, oldest-due first, without locking them.
///
/// The selector never returns these again; this is the hook for the caller's final disposition.
pub fn list_exhausted_fragmentation_sessions<C>(
    conn: &mut C,
    limit: i64,
    max_retry_count: i32,
) -> Result<Vec<FragmentationSession>, FuotaStoreError>
where
    C: FuotaDb,
{
    if limit <= 0 {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT {SESSION_COLUMNS} \
         FROM remote_fragmentation_session s \
         WHERE s.retry_count >= {max_retry_count} \
         ORDER BY {SESSION_ORDER} \
         LIMIT {limit}"
    );
    let rows = conn.load_sessions(&sql)?;
    attach_group_ids(conn, rows)
}

/// Loads the multicast group references for `rows` and maps them into sessions, keeping order.
pub(crate) fn attach_group_ids<C>(
    conn: &mut C,
    rows: Vec<SessionRow>,
) -> Result<Vec<FragmentationSession>, FuotaStoreError>
where
    C: FuotaDb,
{
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let keys = rows
        .iter()
        .map(|row| {
            format!(
                "(g.dev_eui = {} AND g.frag_index = {})",
                quote(&row.dev_eui),
                row.frag_index
            )
        })
        .collect::<Vec<_>>()
        .join(" OR ");
    let sql = format!(
        "SELECT g.dev_eui, g.frag_index, g.mc_group_id \
         FROM remote_fragmentation_session_mc_group g \
         WHERE {keys} \
         ORDER BY g.dev_eui ASC, g.frag_index ASC, g.position ASC"
    );

    let mut groups: HashMap<(String, i32), Vec<i32>> = HashMap::new();
    for group in conn.load_session_groups(&sql)? {
        groups
            .entry((group.dev_eui, group.frag_index))
            .or_default()
            .push(group.mc_group_id);
    }

    rows.into_iter()
        .map(|row| {
            let mc_group_ids = groups
                .remove(&(row.dev_eui.clone(), row.frag_index))
                .unwrap_or_default();
            map_session_row(row, mc_group_ids)
        })
        .collect()
}

fn insert_group_rows<C>(
    conn: &mut C,
    dev_eui: &DevEui,
    frag_index: i32,
    mc_group_ids: &[i32],
) -> Result<(), FuotaStoreError>
where
    C: FuotaDb,
{
    if mc_group_ids.is_empty() {
        return Ok(());
    }

    let dev_eui = quote(&dev_eui.to_hex());
    let values = mc_group_ids
        .iter()
        .enumerate()
        .map(|(position, mc_group_id)| {
            format!("({dev_eui}, {frag_index}, {position}, {mc_group_id})")
        })
        .collect::<Vec<_>>()
        .join(", ");

    conn.execute_sql(&format!(
        "INSERT INTO remote_fragmentation_session_mc_group \
         (dev_eui, frag_index, position, mc_group_id) VALUES {values}"
    ))?;
    Ok(())
}

fn session_exists<C>(
    conn: &mut C,
    dev_eui: &DevEui,
    frag_index: i32,
) -> Result<bool, FuotaStoreError>
where
    C: FuotaDb,
{
    let sql = format!(
        "SELECT COUNT(*) AS count FROM remote_fragmentation_session WHERE {}",
        session_key_predicate(dev_eui, frag_index)
    );
    let count = conn.load_counts(&sql)?.pop().map_or(0, |row| row.count);
    Ok(count > 0)
}

fn session_key_predicate(dev_eui: &DevEui, frag_index: i32) -> String {
    format!(
        "dev_eui = {} AND frag_index = {frag_index}",
        quote(&dev_eui.to_hex())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite_test::setup_in_memory_sqlite;
    use crate::fuota_store::RemoteState;

    fn dev_eui() -> DevEui {
        DevEui([1, 2, 3, 4, 5, 6, 7, 8])
    }

    fn sample_session() -> FragmentationSession {
        let mut session = FragmentationSession::new(dev_eui(), 1);
        session.mc_group_ids = vec![2];
        session.nb_frag = 128;
        session.frag_size = 10;
        session.fragmentation_matrix = 5;
        session.block_ack_delay = 5;
        session.padding = 3;
        session.descriptor = [1, 2, 3, 4];
        session.retry_after = Timestamp::from_unix_millis(1_700_000_000_000);
        session.retry_count = 1;
        session
    }

    #[test]
    fn create_then_get_returns_same_record() {
        let mut conn = setup_in_memory_sqlite();

        let mut session = sample_session();
        create_fragmentation_session(&mut conn, &mut session).expect("failed to create session");
        assert_eq!(session.created_at, session.updated_at);
        assert!(session.created_at.as_unix_millis() > 0);

        let fetched = get_fragmentation_session(&mut conn, &dev_eui(), 1, false)
            .expect("failed to read created session");
        assert_eq!(fetched, session);
    }

    #[test]
    fn create_rejects_duplicate_key() {
        let mut conn = setup_in_memory_sqlite();

        let mut session = sample_session();
        create_fragmentation_session(&mut conn, &mut session).expect("failed to create session");

        let mut duplicate = sample_session();
        duplicate.mc_group_ids = vec![0, 1];
        let err = create_fragmentation_session(&mut conn, &mut duplicate)
            .expect_err("expected duplicate key to be rejected");
        assert!(matches!(err, FuotaStoreError::AlreadyExists(_)));

        let fetched = get_fragmentation_session(&mut conn, &dev_eui(), 1, false)
            .expect("original session should be intact");
        assert_eq!(fetched.mc_group_ids, vec![2]);
    }

    #[test]
    fn create_rejects_malformed_input_before_persistence() {
        let mut conn = setup_in_memory_sqlite();

        let mut session = sample_session();
        session.fragmentation_matrix = 9;
        let err = create_fragmentation_session(&mut conn, &mut session)
            .expect_err("expected out-of-range fragmentation matrix to fail");
        assert!(matches!(err, FuotaStoreError::ConstraintViolation(_)));

        let err = get_fragmentation_session(&mut conn, &dev_eui(), 1, false)
            .expect_err("nothing should have been persisted");
        assert!(matches!(err, FuotaStoreError::NotFound(_)));
    }

    #[test]
    fn update_replaces_all_mutable_fields() {
        let mut conn = setup_in_memory_sqlite();

        let mut session = sample_session();
        create_fragmentation_session(&mut conn, &mut session).expect("failed to create session");

        session.mc_group_ids = vec![1, 2, 3];
        session.nb_frag = 64;
        session.frag_size = 20;
        session.fragmentation_matrix = 3;
        session.block_ack_delay = 10;
        session.padding = 6;
        session.descriptor = [4, 3, 2, 1];
        session.state = RemoteState::Delete;
        session.state_provisioned = true;
        session.retry_after = session.retry_after.saturating_add(std::time::Duration::from_secs(1));
        session.retry_count = 2;
        update_fragmentation_session(&mut conn, &mut session).expect("failed to update session");

        let fetched = get_fragmentation_session(&mut conn, &dev_eui(), 1, true)
            .expect("failed to read updated session");
        assert_eq!(fetched, session);
        assert!(fetched.updated_at >= fetched.created_at);
    }

    #[test]
    fn update_keeps_mc_group_insertion_order() {
        let mut conn = setup_in_memory_sqlite();

        let mut session = sample_session();
        session.mc_group_ids = vec![3, 0, 2];
        create_fragmentation_session(&mut conn, &mut session).expect("failed to create session");

        let fetched = get_fragmentation_session(&mut conn, &dev_eui(), 1, false)
            .expect("failed to read session");
        assert_eq!(fetched.mc_group_ids, vec![3, 0, 2]);

        session.mc_group_ids = vec![];
        update_fragmentation_session(&mut conn, &mut session).expect("failed to switch to unicast");
        let fetched = get_fragmentation_session(&mut conn, &dev_eui(), 1, false)
            .expect("failed to read session");
        assert!(fetched.mc_group_ids.is_empty());
    }

    #[test]
    fn update_rejects_decreasing_retry_count() {
        let mut conn = setup_in_memory_sqlite();

        let mut session = sample_session();
        session.retry_count = 3;
        create_fragmentation_session(&mut conn, &mut session).expect("failed to create session");

        session.retry_count = 2;
        let err = update_fragmentation_session(&mut conn, &mut session)
            .expect_err("expected retry_count regression to fail");
        assert!(matches!(err, FuotaStoreError::ConstraintViolation(_)));

        let fetched = get_fragmentation_session(&mut conn, &dev_eui(), 1, false)
            .expect("failed to read session");
        assert_eq!(fetched.retry_count, 3);
    }

    #[test]
    fn missing_keys_report_not_found() {
        let mut conn = setup_in_memory_sqlite();

        let err = get_fragmentation_session(&mut conn, &dev_eui(), 0, false)
            .expect_err("expected missing get to fail");
        assert!(matches!(err, FuotaStoreError::NotFound(_)));

        let mut session = sample_session();
        let err = update_fragmentation_session(&mut conn, &mut session)
            .expect_err("expected missing update to fail");
        assert!(matches!(err, FuotaStoreError::NotFound(_)));

        let err = delete_fragmentation_session(&mut conn, &dev_eui(), 1)
            .expect_err("expected missing delete to fail");
        assert!(matches!(err, FuotaStoreError::NotFound(_)));
    }

    #[test]
    fn delete_then_get_reports_not_found() {
        let mut conn = setup_in_memory_sqlite();

        let mut session = sample_session();
        create_fragmentation_session(&mut conn, &mut session).expect("failed to create session");
        delete_fragmentation_session(&mut conn, &dev_eui(), 1).expect("failed to delete session");

        let err = get_fragmentation_session(&mut conn, &dev_eui(), 1, false)
            .expect_err("expected deleted session to be gone");
        assert!(matches!(err, FuotaStoreError::NotFound(_)));

        // The key is free again once deleted.
        let mut recreated = sample_session();
        create_fragmentation_session(&mut conn, &mut recreated)
            .expect("failed to recreate session after delete");
    }

    #[test]
    fn exhausted_listing_returns_only_spent_sessions() {
        let mut conn = setup_in_memory_sqlite();

        let mut spent = sample_session();
        spent.retry_count = 5;
        create_fragmentation_session(&mut conn, &mut spent).expect("failed to create spent");

        let mut fresh = sample_session();
        fresh.frag_index = 2;
        fresh.retry_count = 0;
        create_fragmentation_session(&mut conn, &mut fresh).expect("failed to create fresh");

        let exhausted = list_exhausted_fragmentation_sessions(&mut conn, 10, 5)
            .expect("failed to list exhausted sessions");
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].frag_index, 1);
        assert_eq!(exhausted[0].mc_group_ids, vec![2]);

        assert!(list_exhausted_fragmentation_sessions(&mut conn, 0, 5)
            .expect("zero limit is not an error")
            .is_empty());
    }
}
