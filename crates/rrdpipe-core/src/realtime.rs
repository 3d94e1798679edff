//! Realtime CPU and memory sampler.
//!
//! Reads `/proc/stat` and `/proc/meminfo` on every tick. CPU percentages
//! come from the delta against the previous tick, so the first sample
//! carries memory only. Core temperatures come from the `coretemp` hwmon
//! driver when it is loaded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::trace;

use crate::error::{ReportingError, Result};
use crate::fs::{FileSystem, read_dir_or_empty};

/// Interval between realtime samples.
pub const REALTIME_INTERVAL: Duration = Duration::from_secs(2);

/// Cumulative jiffies of one `cpu` line in `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub cpu_id: Option<u32>, // None for the aggregate "cpu" line
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

/// Parses the `cpu` lines of `/proc/stat`.
pub fn parse_cpu_times(content: &str) -> Vec<CpuTimes> {
    let mut cpus = Vec::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(label) = parts.first() else {
            continue;
        };
        let Some(suffix) = label.strip_prefix("cpu") else {
            continue;
        };
        let cpu_id = if suffix.is_empty() {
            None
        } else {
            match suffix.parse() {
                Ok(id) => Some(id),
                Err(_) => continue,
            }
        };

        let get_val =
            |idx: usize| -> u64 { parts.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };

        cpus.push(CpuTimes {
            cpu_id,
            user: get_val(1),
            nice: get_val(2),
            system: get_val(3),
            idle: get_val(4),
            iowait: get_val(5),
            irq: get_val(6),
            softirq: get_val(7),
            steal: get_val(8),
        });
    }

    cpus
}

/// Memory totals from `/proc/meminfo`, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub total: u64,
    pub free: u64,
    pub available: u64,
    pub buffers: u64,
    pub cached: u64,
}

pub fn parse_meminfo(content: &str) -> MemInfo {
    let mut info = MemInfo::default();

    let parse_kb = |line: &str| -> u64 {
        line.split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0)
            * 1024
    };

    for line in content.lines() {
        if line.starts_with("MemTotal:") {
            info.total = parse_kb(line);
        } else if line.starts_with("MemFree:") {
            info.free = parse_kb(line);
        } else if line.starts_with("MemAvailable:") {
            info.available = parse_kb(line);
        } else if line.starts_with("Buffers:") {
            info.buffers = parse_kb(line);
        } else if line.starts_with("Cached:") {
            info.cached = parse_kb(line);
        }
    }

    info
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct VirtualMemory {
    pub total: u64,
    pub available: u64,
    pub percent: f64,
    pub used: u64,
    pub free: u64,
    pub buffers: u64,
    pub cached: u64,
}

impl From<MemInfo> for VirtualMemory {
    fn from(m: MemInfo) -> Self {
        let percent = if m.total > 0 {
            m.total.saturating_sub(m.available) as f64 / m.total as f64 * 100.0
        } else {
            0.0
        };
        Self {
            total: m.total,
            available: m.available,
            percent,
            used: m
                .total
                .saturating_sub(m.free)
                .saturating_sub(m.buffers)
                .saturating_sub(m.cached),
            free: m.free,
            buffers: m.buffers,
            cached: m.cached,
        }
    }
}

/// CPU time shares over one interval, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct CpuUsage {
    /// Everything but idle.
    pub usage: f64,
    pub user: f64,
    pub nice: f64,
    pub system: f64,
    /// Hard and soft interrupts.
    pub interrupt: f64,
    /// Idle plus I/O wait.
    pub idle: f64,
}

impl CpuUsage {
    pub fn between(prev: &CpuTimes, curr: &CpuTimes) -> Self {
        let user = curr.user.saturating_sub(prev.user) as f64;
        let nice = curr.nice.saturating_sub(prev.nice) as f64;
        let system = curr.system.saturating_sub(prev.system) as f64;
        let interrupt = (curr.irq + curr.softirq).saturating_sub(prev.irq + prev.softirq) as f64;
        let idle = (curr.idle + curr.iowait).saturating_sub(prev.idle + prev.iowait) as f64;

        let total = user + nice + system + interrupt + idle;
        if total <= 0.0 {
            return Self {
                usage: 0.0,
                user: 0.0,
                nice: 0.0,
                system: 0.0,
                interrupt: 0.0,
                idle: 0.0,
            };
        }
        let pct = |v: f64| v / total * 100.0;
        Self {
            usage: pct(user + nice + system + interrupt),
            user: pct(user),
            nice: pct(nice),
            system: pct(system),
            interrupt: pct(interrupt),
            idle: pct(idle),
        }
    }
}

/// Core temperatures in degrees Celsius, keyed by core number.
///
/// Scans `<sys_root>/class/hwmon/*` for the `coretemp` driver and reads
/// every `tempN_input` labelled `Core <n>`. Unreadable sensors are skipped.
pub fn read_core_temperatures(fs: &dyn FileSystem, sys_root: &Path) -> BTreeMap<String, f64> {
    let mut temps = BTreeMap::new();
    let hwmons = match read_dir_or_empty(fs, &sys_root.join("class/hwmon")) {
        Ok(hwmons) => hwmons,
        Err(e) => {
            trace!(error = %e, "hwmon not readable");
            return temps;
        }
    };

    for hwmon in hwmons {
        let is_coretemp = fs
            .read_to_string(&hwmon.join("name"))
            .map(|name| name.trim() == "coretemp")
            .unwrap_or(false);
        if !is_coretemp {
            continue;
        }
        let Ok(entries) = fs.read_dir(&hwmon) else {
            continue;
        };
        for entry in entries {
            let Some(sensor) = entry
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix("_label"))
            else {
                continue;
            };
            let Ok(label) = fs.read_to_string(&entry) else {
                continue;
            };
            let Some(core) = label.trim().strip_prefix("Core ") else {
                continue;
            };
            let Some(millis) = fs
                .read_to_string(&hwmon.join(format!("{sensor}_input")))
                .ok()
                .and_then(|raw| raw.trim().parse::<i64>().ok())
            else {
                continue;
            };
            temps
                .entry(core.to_string())
                .or_insert(millis as f64 / 1000.0);
        }
    }
    temps
}

/// Payload of one realtime `ADDED` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct RealtimeSample {
    pub virtual_memory: VirtualMemory,
    /// Per-CPU usage keyed by CPU number, plus `average`.
    pub cpu: BTreeMap<String, CpuUsage>,
    /// Core temperatures in degrees Celsius; empty without a sensor.
    pub temperature: BTreeMap<String, f64>,
}

pub struct RealtimeSampler {
    fs: Arc<dyn FileSystem>,
    proc_root: PathBuf,
    sys_root: PathBuf,
    last: Option<Vec<CpuTimes>>,
}

impl RealtimeSampler {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self::with_proc_root(fs, "/proc")
    }

    pub fn with_proc_root(fs: Arc<dyn FileSystem>, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            proc_root: proc_root.into(),
            sys_root: PathBuf::from("/sys"),
            last: None,
        }
    }

    pub fn with_sys_root(mut self, sys_root: impl Into<PathBuf>) -> Self {
        self.sys_root = sys_root.into();
        self
    }

    pub fn sample(&mut self) -> Result<RealtimeSample> {
        let meminfo = self.fs.read_to_string(&self.proc_root.join("meminfo"))?;
        let stat = self.fs.read_to_string(&self.proc_root.join("stat"))?;
        let current = parse_cpu_times(&stat);
        if current.is_empty() {
            return Err(ReportingError::Parse("no cpu lines in /proc/stat".into()));
        }

        let mut cpu = BTreeMap::new();
        if let Some(last) = &self.last {
            for curr in &current {
                let Some(prev) = last.iter().find(|p| p.cpu_id == curr.cpu_id) else {
                    continue;
                };
                let key = match curr.cpu_id {
                    Some(id) => id.to_string(),
                    None => "average".to_string(),
                };
                cpu.insert(key, CpuUsage::between(prev, curr));
            }
        }
        self.last = Some(current);

        Ok(RealtimeSample {
            virtual_memory: parse_meminfo(&meminfo).into(),
            cpu,
            temperature: read_core_temperatures(self.fs.as_ref(), &self.sys_root),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFs;

    const MEMINFO: &str = "MemTotal:       16384 kB\n\
                           MemFree:         4096 kB\n\
                           MemAvailable:    8192 kB\n\
                           Buffers:         1024 kB\n\
                           Cached:          2048 kB\n\
                           SwapCached:         0 kB\n";

    fn stat(user: u64, idle: u64) -> String {
        format!(
            "cpu  {u2} 0 100 {i2} 0 0 0 0 0 0\n\
             cpu0 {user} 0 50 {idle} 0 0 0 0 0 0\n\
             cpu1 {user} 0 50 {idle} 0 0 0 0 0 0\n\
             intr 12345\n",
            u2 = user * 2,
            i2 = idle * 2,
        )
    }

    #[test]
    fn test_parse_cpu_times() {
        let cpus = parse_cpu_times(&stat(10, 20));
        assert_eq!(cpus.len(), 3);
        assert_eq!(cpus[0].cpu_id, None);
        assert_eq!(cpus[1].cpu_id, Some(0));
        assert_eq!(cpus[2].user, 10);
    }

    #[test]
    fn test_parse_meminfo_ignores_swap_cached() {
        let info = parse_meminfo(MEMINFO);
        assert_eq!(info.total, 16384 * 1024);
        assert_eq!(info.cached, 2048 * 1024);
    }

    #[test]
    fn test_virtual_memory() {
        let vm = VirtualMemory::from(parse_meminfo(MEMINFO));
        assert_eq!(vm.percent, 50.0);
        assert_eq!(vm.used, (16384 - 4096 - 1024 - 2048) * 1024);
    }

    #[test]
    fn test_usage_between() {
        let prev = CpuTimes {
            user: 100,
            idle: 100,
            ..CpuTimes::default()
        };
        let curr = CpuTimes {
            user: 130,
            system: 10,
            irq: 5,
            softirq: 5,
            idle: 140,
            iowait: 10,
            ..CpuTimes::default()
        };
        let usage = CpuUsage::between(&prev, &curr);
        assert_eq!(usage.user, 30.0);
        assert_eq!(usage.interrupt, 10.0);
        assert_eq!(usage.idle, 50.0);
        assert_eq!(usage.usage, 50.0);
    }

    #[test]
    fn test_first_sample_has_memory_only() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/meminfo", MEMINFO);
        fs.add_file("/proc/stat", stat(100, 100));
        let mut sampler = RealtimeSampler::new(Arc::new(fs));

        let first = sampler.sample().unwrap();
        assert!(first.cpu.is_empty());
        assert_eq!(first.virtual_memory.total, 16384 * 1024);
    }

    #[test]
    fn test_second_sample_has_cpu_usage() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/meminfo", MEMINFO);
        fs.add_file("/proc/stat", stat(100, 100));
        let fs = Arc::new(fs);
        let mut sampler = RealtimeSampler::with_proc_root(fs.clone(), "/proc");
        sampler.sample().unwrap();

        // Same counters again: zero delta.
        let second = sampler.sample().unwrap();
        let keys: Vec<&str> = second.cpu.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["0", "1", "average"]);
        assert_eq!(second.cpu["average"].usage, 0.0);
    }

    fn add_hwmon(fs: &mut MockFs, dir: &str, name: &str, sensors: &[(&str, &str, &str)]) {
        let base = format!("/sys/class/hwmon/{dir}");
        fs.add_file(format!("{base}/name"), format!("{name}\n"));
        for (sensor, label, input) in sensors {
            fs.add_file(format!("{base}/{sensor}_label"), format!("{label}\n"));
            fs.add_file(format!("{base}/{sensor}_input"), format!("{input}\n"));
        }
    }

    #[test]
    fn test_core_temperatures_from_coretemp() {
        let mut fs = MockFs::new();
        add_hwmon(
            &mut fs,
            "hwmon0",
            "acpitz",
            &[("temp1", "Core 0", "99000")],
        );
        add_hwmon(
            &mut fs,
            "hwmon1",
            "coretemp",
            &[
                ("temp1", "Package id 0", "50000"),
                ("temp2", "Core 0", "45000"),
                ("temp3", "Core 1", "47500"),
                ("temp4", "Core 2", "garbage"),
            ],
        );

        let temps = read_core_temperatures(&fs, Path::new("/sys"));
        let expected: BTreeMap<String, f64> =
            [("0".to_string(), 45.0), ("1".to_string(), 47.5)].into();
        assert_eq!(temps, expected);
    }

    #[test]
    fn test_sample_carries_temperature() {
        let mut fs = MockFs::new();
        fs.add_file("/host/proc/meminfo", MEMINFO);
        fs.add_file("/host/proc/stat", stat(100, 100));
        add_hwmon(&mut fs, "hwmon3", "coretemp", &[("temp2", "Core 0", "61000")]);
        let mut sampler =
            RealtimeSampler::with_proc_root(Arc::new(fs), "/host/proc").with_sys_root("/sys");

        let sample = sampler.sample().unwrap();
        assert_eq!(sample.temperature.get("0"), Some(&61.0));
    }

    #[test]
    fn test_no_hwmon_means_no_temperature() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/meminfo", MEMINFO);
        fs.add_file("/proc/stat", stat(100, 100));
        let mut sampler = RealtimeSampler::new(Arc::new(fs));
        assert!(sampler.sample().unwrap().temperature.is_empty());
    }

    #[test]
    fn test_missing_proc_is_io_error() {
        let mut sampler = RealtimeSampler::new(Arc::new(MockFs::new()));
        assert_eq!(sampler.sample().unwrap_err().kind(), "io");
    }
}
