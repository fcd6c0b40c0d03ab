use std::fs;
use std::path::PathBuf;

/// Source of the current memory pressure, as a ratio of used to total memory.
pub trait MemoryProbe: Send + Sync {
    /// `None` when the probe cannot read memory statistics.
    fn usage_ratio(&self) -> Option<f64>;
}

/// Reads `MemTotal` / `MemAvailable` from a Linux `meminfo` file.
///
/// The read is synchronous; it is a single small file and treated as a brief
/// blocking point.
#[derive(Clone, Debug)]
pub struct MeminfoProbe {
    path: PathBuf,
}

impl Default for MeminfoProbe {
    fn default() -> Self {
        Self { path: PathBuf::from("/proc/meminfo") }
    }
}

impl MeminfoProbe {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MemoryProbe for MeminfoProbe {
    fn usage_ratio(&self) -> Option<f64> {
        let raw = fs::read_to_string(&self.path).ok()?;
        parse_meminfo(&raw)
    }
}

/// Probe with a fixed reading, for callers that sample memory elsewhere.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedMemoryProbe(pub Option<f64>);

impl MemoryProbe for FixedMemoryProbe {
    fn usage_ratio(&self) -> Option<f64> {
        self.0
    }
}

fn parse_meminfo(raw: &str) -> Option<f64> {
    let mut total = None;
    let mut available = None;

    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next().and_then(|value| value.parse::<f64>().ok()),
            Some("MemAvailable:") => {
                available = parts.next().and_then(|value| value.parse::<f64>().ok())
            }
            _ => {}
        }
    }

    let (total, available) = (total?, available?);
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total).clamp(0.0, 1.0))
}
