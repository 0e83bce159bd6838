//! # Memory Governor
//!
//! Between-batch policy: always run one reclamation pass, sample system memory utilization,
//! and run an extra pass when utilization is above the high-water mark. Both the probe and
//! the reclamation callback are pluggable.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;
use tracing::warn;

/// Source of system memory utilization in `[0, 1]`.
pub trait MemoryProbe: Send + Sync {
  fn utilization(&self) -> Option<f64>;
}

/// Parse `MemTotal` / `MemAvailable` out of a `/proc/meminfo` document.
pub fn parse_meminfo(text: &str) -> Option<f64> {
  let field = |name: &str| -> Option<f64> {
    text
      .lines()
      .find(|l| l.starts_with(name))
      .and_then(|l| l.split_whitespace().nth(1))
      .and_then(|v| v.parse::<f64>().ok())
  };
  let total = field("MemTotal:")?;
  let available = field("MemAvailable:")?;
  if total <= 0.0 {
    return None;
  }
  Some(((total - available) / total).clamp(0.0, 1.0))
}

/// Reads utilization from a meminfo file (Linux `/proc/meminfo` by default).
#[derive(Clone, Debug)]
pub struct ProcMeminfo {
  path: PathBuf,
}

impl ProcMeminfo {
  pub fn new() -> Self {
    Self {
      path: PathBuf::from("/proc/meminfo"),
    }
  }

  pub fn at(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }
}

impl Default for ProcMeminfo {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryProbe for ProcMeminfo {
  fn utilization(&self) -> Option<f64> {
    fs::read_to_string(&self.path)
      .ok()
      .and_then(|text| parse_meminfo(&text))
  }
}

/// Return freed heap pages to the operating system.
pub fn trim_heap() {
  #[cfg(all(target_os = "linux", target_env = "gnu"))]
  // SAFETY: malloc_trim only walks allocator-internal free lists.
  unsafe {
    libc::malloc_trim(0);
  }
}

pub type Reclaim = Arc<dyn Fn() + Send + Sync>;

/// High-water policy run after every batch.
#[derive(Clone)]
pub struct MemoryGovernor {
  high_water: f64,
  probe: Arc<dyn MemoryProbe>,
  reclaim: Reclaim,
}

impl MemoryGovernor {
  pub fn new(high_water: f64) -> Self {
    Self {
      high_water,
      probe: Arc::new(ProcMeminfo::new()),
      reclaim: Arc::new(trim_heap),
    }
  }

  pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
    self.probe = probe;
    self
  }

  pub fn with_reclaim(mut self, reclaim: Reclaim) -> Self {
    self.reclaim = reclaim;
    self
  }

  pub fn high_water(&self) -> f64 {
    self.high_water
  }

  /// Reclaim, sample, and reclaim again under pressure. Returns the sampled utilization.
  pub fn after_batch(&self) -> Option<f64> {
    (self.reclaim)();
    let utilization = self.probe.utilization();
    match utilization {
      Some(u) if u > self.high_water => {
        warn!(
          utilization = u,
          high_water = self.high_water,
          "memory above high-water mark, forcing extra reclamation"
        );
        (self.reclaim)();
      }
      Some(u) => debug!(utilization = u, "memory sample"),
      None => debug!("memory utilization unavailable"),
    }
    utilization
  }
}

impl std::fmt::Debug for MemoryGovernor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MemoryGovernor")
      .field("high_water", &self.high_water)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;

  struct Fixed(Option<f64>);

  impl MemoryProbe for Fixed {
    fn utilization(&self) -> Option<f64> {
      self.0
    }
  }

  fn counting() -> (Arc<AtomicUsize>, Reclaim) {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    (calls, Arc::new(move || {
      c.fetch_add(1, Ordering::SeqCst);
    }))
  }

  #[test]
  fn parses_meminfo() {
    let text = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
    assert_eq!(parse_meminfo(text), Some(0.75));
    assert_eq!(parse_meminfo("MemTotal: 10 kB\n"), None);
  }

  #[test]
  fn reads_meminfo_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "MemTotal: 100 kB\nMemAvailable: 10 kB").unwrap();
    let probe = ProcMeminfo::at(file.path());
    assert_eq!(probe.utilization(), Some(0.9));
  }

  #[test]
  fn extra_pass_only_above_high_water() {
    let (calls, reclaim) = counting();
    let calm = MemoryGovernor::new(0.85)
      .with_probe(Arc::new(Fixed(Some(0.5))))
      .with_reclaim(reclaim);
    assert_eq!(calm.after_batch(), Some(0.5));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let (calls, reclaim) = counting();
    let pressured = MemoryGovernor::new(0.85)
      .with_probe(Arc::new(Fixed(Some(0.95))))
      .with_reclaim(reclaim);
    pressured.after_batch();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let (calls, reclaim) = counting();
    let blind = MemoryGovernor::new(0.85)
      .with_probe(Arc::new(Fixed(None)))
      .with_reclaim(reclaim);
    assert_eq!(blind.after_batch(), None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
