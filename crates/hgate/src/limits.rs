// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Environment-derived resource limits.
//!
//! Detects cgroup v2 (`/proc/self/cgroup` line starting `0::`) and v1
//! (the `cpu` controller), reads the CPU quota and memory limit, and
//! exposes the effective vCPU count and available memory. All reads are
//! parameterised by a filesystem root for testability.

use std::fs;
use std::path::{Path, PathBuf};

/// Effective vCPU count: hardware concurrency, capped by the cgroup CPU
/// quota when one is set.
pub fn vcpu_count() -> usize {
    vcpu_count_at(Path::new("/"))
}

/// Available memory in bytes: system memory, capped by the cgroup
/// memory limit when one is set.
pub fn available_memory() -> u64 {
    available_memory_at(Path::new("/"))
}

fn hardware_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn system_memory(root: &Path) -> u64 {
    // MemTotal is in kibibytes.
    read_string(&root.join("proc/meminfo"))
        .and_then(|text| {
            text.lines().find_map(|line| {
                let rest = line.strip_prefix("MemTotal:")?;
                let kib: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
                Some(kib * 1024)
            })
        })
        .unwrap_or(u64::MAX)
}

pub(crate) fn vcpu_count_at(root: &Path) -> usize {
    let hardware = hardware_concurrency();
    match cgroup_cpu_quota(root) {
        Some((quota, period)) if period > 0 => {
            let from_quota = (quota + period - 1) / period;
            hardware.min(from_quota.max(1) as usize)
        }
        _ => hardware,
    }
}

pub(crate) fn available_memory_at(root: &Path) -> u64 {
    let system = system_memory(root);
    match cgroup_memory_limit(root) {
        Some(limit) => system.min(limit),
        None => system,
    }
}

/// Which cgroup hierarchy the process runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CgroupVersion {
    V2 { path: String },
    V1 { cpu_path: String },
}

fn detect_cgroup(root: &Path) -> Option<CgroupVersion> {
    let text = read_string(&root.join("proc/self/cgroup"))?;

    for line in text.lines() {
        // cgroup v2: a single line of the form `0::<path>`.
        if let Some(path) = line.strip_prefix("0::") {
            return Some(CgroupVersion::V2 {
                path: path.trim().to_string(),
            });
        }
    }
    for line in text.lines() {
        // cgroup v1: `<id>:<controllers>:<path>` with a cpu controller.
        let mut parts = line.splitn(3, ':');
        let _id = parts.next()?;
        let controllers = parts.next()?;
        let path = parts.next()?;
        if controllers.split(',').any(|c| c == "cpu") {
            return Some(CgroupVersion::V1 {
                cpu_path: path.trim().to_string(),
            });
        }
    }
    None
}

/// CPU quota as `(quota_us, period_us)`; `None` when unlimited.
fn cgroup_cpu_quota(root: &Path) -> Option<(u64, u64)> {
    match detect_cgroup(root)? {
        CgroupVersion::V2 { path } => {
            // cpu.max: "max 100000" or "<quota> <period>".
            let text = read_string(&cgroup_file(root, &path, "cpu.max"))?;
            let mut parts = text.split_whitespace();
            let quota = parts.next()?;
            let period: u64 = parts.next()?.parse().ok()?;
            if quota == "max" {
                None
            } else {
                Some((quota.parse().ok()?, period))
            }
        }
        CgroupVersion::V1 { cpu_path } => {
            let base = root.join("sys/fs/cgroup/cpu").join(trim_slash(&cpu_path));
            let quota: i64 = read_string(&base.join("cpu.cfs_quota_us"))?.trim().parse().ok()?;
            if quota < 0 {
                return None;
            }
            let period: u64 = read_string(&base.join("cpu.cfs_period_us"))?.trim().parse().ok()?;
            Some((quota as u64, period))
        }
    }
}

/// Memory limit in bytes; `None` when unlimited.
fn cgroup_memory_limit(root: &Path) -> Option<u64> {
    match detect_cgroup(root)? {
        CgroupVersion::V2 { path } => {
            let text = read_string(&cgroup_file(root, &path, "memory.max"))?;
            let text = text.trim();
            if text == "max" {
                None
            } else {
                text.parse().ok()
            }
        }
        CgroupVersion::V1 { cpu_path: _ } => {
            // The memory controller mounts under its own hierarchy; the
            // common layouts use the same relative path.
            let text = read_string(&root.join("sys/fs/cgroup/memory/memory.limit_in_bytes"))?;
            let limit: u64 = text.trim().parse().ok()?;
            // Kernels report "unlimited" as a huge page-rounded value.
            if limit >= i64::MAX as u64 / 2 {
                None
            } else {
                Some(limit)
            }
        }
    }
}

fn cgroup_file(root: &Path, cgroup_path: &str, file: &str) -> PathBuf {
    root.join("sys/fs/cgroup")
        .join(trim_slash(cgroup_path))
        .join(file)
}

fn trim_slash(path: &str) -> &str {
    path.trim_start_matches('/')
}

fn read_string(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeRoot {
        dir: PathBuf,
    }

    impl FakeRoot {
        fn new(name: &str) -> Self {
            let dir = std::env::temp_dir()
                .join(format!("hgate-limits-{}-{name}", std::process::id()));
            let _ = fs::remove_dir_all(&dir);
            fs::create_dir_all(dir.join("proc/self")).unwrap();
            Self { dir }
        }

        fn write(&self, rel: &str, content: &str) {
            let path = self.dir.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    impl Drop for FakeRoot {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    #[test]
    fn test_cgroup_v2_quota() {
        let root = FakeRoot::new("v2");
        root.write("proc/self/cgroup", "0::/kube/pod7\n");
        root.write("sys/fs/cgroup/kube/pod7/cpu.max", "200000 100000\n");
        root.write("proc/meminfo", "MemTotal:       16384000 kB\n");
        root.write("sys/fs/cgroup/kube/pod7/memory.max", "1073741824\n");

        // Quota of two full CPUs caps the count at two.
        assert!(vcpu_count_at(&root.dir) <= 2);
        assert_eq!(available_memory_at(&root.dir), 1 << 30);
    }

    #[test]
    fn test_cgroup_v2_unlimited() {
        let root = FakeRoot::new("v2max");
        root.write("proc/self/cgroup", "0::/\n");
        root.write("sys/fs/cgroup/cpu.max", "max 100000\n");
        root.write("proc/meminfo", "MemTotal: 8192000 kB\n");
        root.write("sys/fs/cgroup/memory.max", "max\n");

        assert_eq!(vcpu_count_at(&root.dir), hardware_concurrency());
        assert_eq!(available_memory_at(&root.dir), 8_192_000 * 1024);
    }

    #[test]
    fn test_cgroup_v1() {
        let root = FakeRoot::new("v1");
        root.write(
            "proc/self/cgroup",
            "12:memory:/docker/abc\n3:cpu,cpuacct:/docker/abc\n",
        );
        root.write("sys/fs/cgroup/cpu/docker/abc/cpu.cfs_quota_us", "150000\n");
        root.write("sys/fs/cgroup/cpu/docker/abc/cpu.cfs_period_us", "100000\n");
        root.write("proc/meminfo", "MemTotal: 4096000 kB\n");
        root.write(
            "sys/fs/cgroup/memory/memory.limit_in_bytes",
            "536870912\n",
        );

        // 1.5 CPUs rounds up to 2, still capped by the hardware.
        assert!(vcpu_count_at(&root.dir) <= 2);
        assert_eq!(available_memory_at(&root.dir), 512 << 20);
    }

    #[test]
    fn test_no_cgroup_falls_back_to_hardware() {
        let root = FakeRoot::new("none");
        root.write("proc/meminfo", "MemTotal: 1024000 kB\n");

        assert_eq!(vcpu_count_at(&root.dir), hardware_concurrency());
        assert_eq!(available_memory_at(&root.dir), 1_024_000 * 1024);
    }
}
