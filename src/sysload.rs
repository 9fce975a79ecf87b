//! Local load figures advertised in heartbeats, read from procfs.
//! Both report 0.0 where procfs is unavailable.

/// One-minute load average as a percentage of available cores.
pub fn cpu_load_percent() -> f32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| parse_loadavg(&s))
        .map(|load| (load / cores as f32 * 100.0).clamp(0.0, 100.0))
        .unwrap_or(0.0)
}

/// Share of physical memory in use, as a percentage.
pub fn memory_usage_percent() -> f32 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|s| parse_meminfo(&s))
        .unwrap_or(0.0)
}

fn parse_loadavg(content: &str) -> Option<f32> {
    content.split_whitespace().next()?.parse().ok()
}

fn parse_meminfo(content: &str) -> Option<f32> {
    let field = |name: &str| -> Option<f64> {
        content
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };

    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some((((total - available) / total) * 100.0).clamp(0.0, 100.0) as f32)
}
