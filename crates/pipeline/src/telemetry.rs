use sysinfo::System;

/// Share of system memory in use, clamped to 0-100.
///
/// `None` when the platform reports no memory at all.
pub fn memory_usage_percent() -> Option<f64> {
    let mut system = System::new();
    system.refresh_memory();
    memory_percent(system.used_memory(), system.total_memory())
}

fn memory_percent(used: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    let percent = (used as f64 / total as f64) * 100.0;
    if percent.is_nan() || percent.is_infinite() {
        None
    } else {
        Some(percent.clamp(0.0, 100.0))
    }
}
