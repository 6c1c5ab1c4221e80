use core_affinity::{CoreId, get_core_ids, set_for_current};

/// Pin the current thread to `core_id`. Returns the pinned id, or an error
/// when the OS does not report the core or refuses the affinity change.
pub fn try_pin_core(core_id: usize) -> anyhow::Result<usize> {
    if let Some(cores) = get_core_ids()
        && cores.iter().any(|c| c.id == core_id)
        && set_for_current(CoreId { id: core_id })
    {
        return Ok(core_id);
    }
    Err(anyhow::anyhow!("failed to pin core {core_id}"))
}
