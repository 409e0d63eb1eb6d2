#![cfg(feature = "sqlite-tests")]

use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{BigInt, Text};
use fuota_worker_lib::db::sqlite_test::setup_in_memory_sqlite;
use fuota_worker_lib::fuota_store::{
    create_fragmentation_session, create_multicast_setup, DevEui, FragmentationSession,
    MulticastSetup,
};
use uuid::Uuid;

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(QueryableByName)]
struct NameRow {
    #[diesel(sql_type = Text)]
    name: String,
}

fn count(conn: &mut SqliteConnection, sql: &str) -> i64 {
    sql_query(sql)
        .get_result::<CountRow>(conn)
        .expect("failed to run count query")
        .count
}

#[test]
fn sqlite_harness_runs_expected_schema_migrations() {
    let mut conn = setup_in_memory_sqlite();

    let rows: Vec<NameRow> = sql_query(
        "
        SELECT name
        FROM sqlite_master
        WHERE type = 'table'
          AND name LIKE 'remote_%'
        ORDER BY name
        ",
    )
    .load(&mut conn)
    .expect("failed to query sqlite_master");

    let names: Vec<String> = rows.into_iter().map(|row| row.name).collect();
    assert_eq!(
        names,
        vec![
            "remote_fragmentation_session".to_string(),
            "remote_fragmentation_session_mc_group".to_string(),
            "remote_multicast_setup".to_string(),
        ]
    );
}

#[test]
fn sqlite_harness_creates_lease_columns_and_due_indexes() {
    let mut conn = setup_in_memory_sqlite();

    for table in ["remote_fragmentation_session", "remote_multicast_setup"] {
        let lease_columns = count(
            &mut conn,
            &format!(
                "SELECT COUNT(*) AS count FROM pragma_table_info('{table}') \
                 WHERE name IN ('lease_owner', 'lease_expires_at')"
            ),
        );
        assert_eq!(lease_columns, 2, "{table} should carry the lease columns");
    }

    let index_count = count(
        &mut conn,
        "SELECT COUNT(*) AS count FROM sqlite_master \
         WHERE type = 'index' AND name LIKE 'idx_remote_%_retry_after'",
    );
    assert_eq!(index_count, 2);
}

#[test]
fn sqlite_harness_enforces_check_constraints() {
    let mut conn = setup_in_memory_sqlite();

    let bad_frag_index = sql_query(
        "INSERT INTO remote_fragmentation_session \
         (dev_eui, frag_index, nb_frag, frag_size, fragmentation_matrix, block_ack_delay, \
          padding, descriptor, state, state_provisioned, retry_after, retry_count, \
          created_at, updated_at) \
         VALUES ('0102030405060708', -1, 1, 1, 0, 0, 0, '00000000', 'setup', FALSE, 0, 0, 0, 0)",
    )
    .execute(&mut conn);
    assert!(bad_frag_index.is_err(), "negative frag_index must be rejected");

    let bad_state = sql_query(
        "INSERT INTO remote_multicast_setup \
         (dev_eui, multicast_group_id, mc_group_id, mc_addr, mc_key_encrypted, min_mc_fcnt, \
          max_mc_fcnt, state, state_provisioned, retry_after, retry_count, created_at, \
          updated_at) \
         VALUES ('0102030405060708', 'g', 0, '00000000', '00000000000000000000000000000000', \
                 0, 10, 'paused', FALSE, 0, 0, 0, 0)",
    )
    .execute(&mut conn);
    assert!(bad_state.is_err(), "unknown state must be rejected");
}

#[test]
fn sqlite_harness_cascades_group_rows_with_their_session() {
    let mut conn = setup_in_memory_sqlite();
    let dev_eui = DevEui([1, 2, 3, 4, 5, 6, 7, 8]);

    let mut group = MulticastSetup::new(dev_eui, Uuid::from_u128(7), 1);
    create_multicast_setup(&mut conn, &mut group).expect("failed to create multicast setup");

    let mut session = FragmentationSession::new(dev_eui, 0);
    session.mc_group_ids = vec![1, 0];
    create_fragmentation_session(&mut conn, &mut session).expect("failed to create session");
    assert_eq!(
        count(
            &mut conn,
            "SELECT COUNT(*) AS count FROM remote_fragmentation_session_mc_group"
        ),
        2
    );

    sql_query("DELETE FROM remote_fragmentation_session")
        .execute(&mut conn)
        .expect("failed to delete sessions");
    assert_eq!(
        count(
            &mut conn,
            "SELECT COUNT(*) AS count FROM remote_fragmentation_session_mc_group"
        ),
        0
    );
    assert_eq!(
        count(&mut conn, "SELECT COUNT(*) AS count FROM remote_multicast_setup"),
        1,
        "multicast setups are independent of sessions"
    );
}

#[test]
fn sqlite_harness_rejects_orphan_group_rows() {
    let mut conn = setup_in_memory_sqlite();

    let orphan = sql_query(
        "INSERT INTO remote_fragmentation_session_mc_group \
         (dev_eui, frag_index, position, mc_group_id) \
         VALUES ('0102030405060708', 0, 0, 1)",
    )
    .execute(&mut conn);
    assert!(orphan.is_err(), "group rows need an owning session");
}
