use core_affinity::{CoreId, get_core_ids, set_for_current};

/// Pin the current thread to `core_id`. Fails when the OS does not
/// report that core or refuses the affinity change.
pub fn pin_to_core(core_id: usize) -> anyhow::Result<()> {
    let cores = get_core_ids().unwrap_or_default();
    if !cores.iter().any(|c| c.id == core_id) {
        anyhow::bail!("core {core_id} is not available (reported: {})", cores.len());
    }
    if !set_for_current(CoreId { id: core_id }) {
        anyhow::bail!("failed to set affinity for core {core_id}");
    }
    Ok(())
}
