use tracing::debug;
use uuid::Uuid;

use super::store::{map_multicast_setup_row, quote, quote_hex, sql_bool, FuotaDb};
use super::types::{describe_multicast_key, DevEui, FuotaStoreError, MulticastSetup, Timestamp};

/// Column list for `remote_multicast_setup` aliased as `s`, in `MulticastSetupRow` order.
pub(crate) const MULTICAST_SETUP_COLUMNS: &str = "s.dev_eui, s.multicast_group_id, \
     s.mc_group_id, s.mc_addr, s.mc_key_encrypted, s.min_mc_fcnt, s.max_mc_fcnt, s.state, \
     s.state_provisioned, s.retry_after, s.retry_count, s.created_at, s.updated_at";

pub(crate) const MULTICAST_SETUP_ORDER: &str =
    "s.retry_after ASC, s.dev_eui ASC, s.multicast_group_id ASC";

/// Inserts a device's membership of a multicast group.
///
/// Fails with `AlreadyExists` when the device already has this group or already uses the slot.
pub fn create_multicast_setup<C>(
    conn: &mut C,
    setup: &mut MulticastSetup,
) -> Result<(), FuotaStoreError>
where
    C: FuotaDb,
{
    setup.validate()?;
    let now = Timestamp::now();

    let insert_sql = format!(
        "INSERT INTO remote_multicast_setup \
         (dev_eui, multicast_group_id, mc_group_id, mc_addr, mc_key_encrypted, min_mc_fcnt, \
          max_mc_fcnt, state, state_provisioned, retry_after, retry_count, created_at, updated_at) \
         VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {now_ms}, {now_ms}) \
         ON CONFLICT DO NOTHING",
        quote(&setup.dev_eui.to_hex()),
        quote(&setup.multicast_group_id.to_string()),
        setup.mc_group_id,
        quote_hex(&setup.mc_addr),
        quote_hex(&setup.mc_key_encrypted),
        setup.min_mc_fcnt,
        setup.max_mc_fcnt,
        quote(setup.state.as_db_str()),
        sql_bool(setup.state_provisioned),
        setup.retry_after.as_unix_millis(),
        setup.retry_count,
        now_ms = now.as_unix_millis(),
    );
    if conn.execute_sql(&insert_sql)? == 0 {
        return Err(FuotaStoreError::AlreadyExists(format!(
            "{} or slot mc_group_id={}",
            setup.describe_key(),
            setup.mc_group_id
        )));
    }

    setup.created_at = now;
    setup.updated_at = now;

    debug!(
        event = "multicast_setup_created",
        dev_eui = %setup.dev_eui,
        multicast_group_id = %setup.multicast_group_id,
        mc_group_id = setup.mc_group_id,
        "created multicast setup"
    );
    Ok(())
}

/// Reads one multicast setup by its group reference.
pub fn get_multicast_setup<C>(
    conn: &mut C,
    dev_eui: &DevEui,
    multicast_group_id: &Uuid,
    for_update: bool,
) -> Result<MulticastSetup, FuotaStoreError>
where
    C: FuotaDb,
{
    let sql = format!(
        "SELECT {MULTICAST_SETUP_COLUMNS} \
         FROM remote_multicast_setup s \
         WHERE s.dev_eui = {} AND s.multicast_group_id = {}{}",
        quote(&dev_eui.to_hex()),
        quote(&multicast_group_id.to_string()),
        conn.lease_strategy().row_lock_clause(for_update),
    );

    match conn.load_multicast_setups(&sql)?.pop() {
        Some(row) => map_multicast_setup_row(row),
        None => Err(FuotaStoreError::NotFound(describe_multicast_key(
            dev_eui,
            multicast_group_id,
        ))),
    }
}

/// Reads the multicast setup occupying a device's group slot.
pub fn get_multicast_setup_by_slot<C>(
    conn: &mut C,
    dev_eui: &DevEui,
    mc_group_id: i32,
) -> Result<MulticastSetup, FuotaStoreError>
where
    C: FuotaDb,
{
    let sql = format!(
        "SELECT {MULTICAST_SETUP_COLUMNS} \
         FROM remote_multicast_setup s \
         WHERE s.dev_eui = {} AND s.mc_group_id = {mc_group_id}",
        quote(&dev_eui.to_hex()),
    );

    match conn.load_multicast_setups(&sql)?.pop() {
        Some(row) => map_multicast_setup_row(row),
        None => Err(FuotaStoreError::NotFound(format!(
            "multicast setup (dev_eui={dev_eui}, mc_group_id={mc_group_id})"
        ))),
    }
}

/// Lists every multicast setup of a device ordered by slot.
pub fn list_multicast_setups_for_device<C>(
    conn: &mut C,
    dev_eui: &DevEui,
) -> Result<Vec<MulticastSetup>, FuotaStoreError>
where
    C: FuotaDb,
{
    let sql = format!(
        "SELECT {MULTICAST_SETUP_COLUMNS} \
         FROM remote_multicast_setup s \
         WHERE s.dev_eui = {} \
         ORDER BY s.mc_group_id ASC",
        quote(&dev_eui.to_hex()),
    );

    conn.load_multicast_setups(&sql)?
        .into_iter()
        .map(map_multicast_setup_row)
        .collect()
}

/// Replaces the mutable fields of a multicast setup.
///
/// Flipping `state_provisioned` here is what unblocks fragmentation sessions that reference the
/// slot. Like session updates, `retry_count` may not decrease and a held column lease is released.
pub fn update_multicast_setup<C>(
    conn: &mut C,
    setup: &mut MulticastSetup,
) -> Result<(), FuotaStoreError>
where
    C: FuotaDb,
{
    setup.validate()?;
    let now = Timestamp::now();
    let key = multicast_key_predicate(&setup.dev_eui, &setup.multicast_group_id);

    let update_sql = format!(
        "UPDATE remote_multicast_setup \
         SET mc_group_id = {}, mc_addr = {}, mc_key_encrypted = {}, min_mc_fcnt = {}, \
             max_mc_fcnt = {}, state = {}, state_provisioned = {}, retry_after = {}, \
             retry_count = {}, updated_at = {}{} \
         WHERE {key} AND retry_count <= {}",
        setup.mc_group_id,
        quote_hex(&setup.mc_addr),
        quote_hex(&setup.mc_key_encrypted),
        setup.min_mc_fcnt,
        setup.max_mc_fcnt,
        quote(setup.state.as_db_str()),
        sql_bool(setup.state_provisioned),
        setup.retry_after.as_unix_millis(),
        setup.retry_count,
        now.as_unix_millis(),
        conn.lease_strategy().release_assignments(),
        setup.retry_count,
    );

    if conn.execute_sql(&update_sql)? == 0 {
        let exists = get_multicast_setup(conn, &setup.dev_eui, &setup.multicast_group_id, false);
        return Err(match exists {
            Ok(_) => FuotaStoreError::ConstraintViolation(format!(
                "retry_count of {} must not decrease below the stored value",
                setup.describe_key()
            )),
            Err(err) => err,
        });
    }

    setup.updated_at = now;

    debug!(
        event = "multicast_setup_updated",
        dev_eui = %setup.dev_eui,
        multicast_group_id = %setup.multicast_group_id,
        mc_group_id = setup.mc_group_id,
        state_provisioned = setup.state_provisioned,
        retry_count = setup.retry_count,
        "updated multicast setup"
    );
    Ok(())
}

/// Removes a multicast setup.
///
/// Sessions still referencing the slot are left alone; they simply stop being selectable.
pub fn delete_multicast_setup<C>(
    conn: &mut C,
    dev_eui: &DevEui,
    multicast_group_id: &Uuid,
) -> Result<(), FuotaStoreError>
where
    C: FuotaDb,
{
    let deleted = conn.execute_sql(&format!(
        "DELETE FROM remote_multicast_setup WHERE {}",
        multicast_key_predicate(dev_eui, multicast_group_id)
    ))?;
    if deleted == 0 {
        return Err(FuotaStoreError::NotFound(describe_multicast_key(
            dev_eui,
            multicast_group_id,
        )));
    }

    debug!(
        event = "multicast_setup_deleted",
        dev_eui = %dev_eui,
        multicast_group_id = %multicast_group_id,
        "deleted multicast setup"
    );
    Ok(())
}

fn multicast_key_predicate(dev_eui: &DevEui, multicast_group_id: &Uuid) -> String {
    format!(
        "dev_eui = {} AND multicast_group_id = {}",
        quote(&dev_eui.to_hex()),
        quote(&multicast_group_id.to_string())
    )
}
