//! Scheduler policy: pin the hot threads where the fast cores are.
//!
//! CPU capability is read from sysfs max-frequency entries and split into
//! three classes: the single prime core, the remaining performance cores,
//! and the efficiency cores. Every placement request is best-effort — a
//! denied affinity mask or real-time class is logged and ignored, and the
//! emulator keeps running wherever the kernel puts it.

use std::fs;

use log::{debug, warn};

/// What kind of work a thread does, which decides where it wants to live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadRole {
    /// The primary executor: the single highest-capability CPU, real-time
    /// class, highest priority.
    Executor,
    /// Translator-associated workers: the performance-class CPUs.
    Worker,
    /// Compression, telemetry, deferred flushes: efficiency-class CPUs.
    Background,
}

/// The host's CPU topology as three capability classes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuClasses {
    pub prime: Vec<usize>,
    pub performance: Vec<usize>,
    pub efficiency: Vec<usize>,
}

impl CpuClasses {
    /// Classifies CPUs by their advertised maximum frequency: the top
    /// frequency is prime, anything above the median is performance, the
    /// rest are efficiency. Single-class hosts (desktops, VMs) collapse to
    /// everything-is-prime, which keeps every request satisfiable.
    pub fn detect() -> CpuClasses {
        let cpus = num_cpus::get();
        let mut freqs: Vec<(usize, u64)> = (0..cpus)
            .map(|cpu| (cpu, read_max_freq(cpu).unwrap_or(0)))
            .collect();
        Self::from_frequencies(&mut freqs)
    }

    fn from_frequencies(freqs: &mut [(usize, u64)]) -> CpuClasses {
        let mut classes = CpuClasses::default();
        if freqs.is_empty() {
            return classes;
        }
        let top = freqs.iter().map(|&(_, f)| f).max().unwrap_or(0);
        let min = freqs.iter().map(|&(_, f)| f).min().unwrap_or(0);
        if top == min {
            // Homogeneous: no meaningful classes.
            classes.prime = freqs.iter().map(|&(cpu, _)| cpu).collect();
            classes.performance = classes.prime.clone();
            classes.efficiency = classes.prime.clone();
            return classes;
        }
        freqs.sort_by_key(|&(cpu, freq)| (std::cmp::Reverse(freq), cpu));
        let mid = (top + min) / 2;
        for &(cpu, freq) in freqs.iter() {
            if freq == top && classes.prime.is_empty() {
                classes.prime.push(cpu);
            } else if freq > mid {
                classes.performance.push(cpu);
            } else {
                classes.efficiency.push(cpu);
            }
        }
        if classes.performance.is_empty() {
            classes.performance = classes.prime.clone();
        }
        if classes.efficiency.is_empty() {
            classes.efficiency = classes.performance.clone();
        }
        classes
    }

    fn cpus_for(&self, role: ThreadRole) -> &[usize] {
        match role {
            ThreadRole::Executor => &self.prime,
            ThreadRole::Worker => &self.performance,
            ThreadRole::Background => &self.efficiency,
        }
    }
}

fn read_max_freq(cpu: usize) -> Option<u64> {
    let path = format!("/sys/devices/system/cpu/cpu{cpu}/cpufreq/cpuinfo_max_freq");
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Applies the placement policy for `role` to the calling thread.
/// Idempotent and commutative per thread; never fails the caller.
pub fn apply_thread_policy(classes: &CpuClasses, role: ThreadRole) {
    set_affinity(classes.cpus_for(role), role);
    if role == ThreadRole::Executor {
        request_realtime_priority();
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_affinity(cpus: &[usize], role: ThreadRole) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    if cpus.is_empty() {
        return;
    }
    let mut set = CpuSet::new();
    for &cpu in cpus {
        if set.set(cpu).is_err() {
            return;
        }
    }
    match sched_setaffinity(Pid::from_raw(0), &set) {
        Ok(()) => debug!("{role:?} thread pinned to CPUs {cpus:?}"),
        Err(e) => warn!("{role:?} affinity request for {cpus:?} denied: {e}; continuing"),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_affinity(_cpus: &[usize], _role: ThreadRole) {}

/// SCHED_FIFO at the maximum priority for the executor, when permitted.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn request_realtime_priority() {
    unsafe {
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if max < 0 {
            return;
        }
        let param = libc::sched_param {
            sched_priority: max,
        };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            warn!(
                "real-time class unavailable ({}); staying in the default class",
                std::io::Error::last_os_error()
            );
        } else {
            debug!("executor thread running SCHED_FIFO priority {max}");
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn request_realtime_priority() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_little_topology_classifies() {
        // A 1+3+4 phone topology.
        let mut freqs = vec![
            (0, 2_000_000u64),
            (1, 2_000_000),
            (2, 2_000_000),
            (3, 2_000_000),
            (4, 2_800_000),
            (5, 2_800_000),
            (6, 2_800_000),
            (7, 3_200_000),
        ];
        let classes = CpuClasses::from_frequencies(&mut freqs);
        assert_eq!(classes.prime, vec![7]);
        assert_eq!(classes.performance, vec![4, 5, 6]);
        assert_eq!(classes.efficiency, vec![0, 1, 2, 3]);
    }

    #[test]
    fn homogeneous_topology_satisfies_every_role() {
        let mut freqs = vec![(0, 1_000u64), (1, 1_000), (2, 1_000), (3, 1_000)];
        let classes = CpuClasses::from_frequencies(&mut freqs);
        assert_eq!(classes.prime.len(), 4);
        assert_eq!(classes.performance.len(), 4);
        assert_eq!(classes.efficiency.len(), 4);
    }

    #[test]
    fn two_tier_topology_backfills_the_missing_class() {
        let mut freqs = vec![(0, 3_000_000u64), (1, 2_900_000)];
        let classes = CpuClasses::from_frequencies(&mut freqs);
        assert_eq!(classes.prime, vec![0]);
        // No middle class: workers share the prime core, background work
        // gets the slow one.
        assert_eq!(classes.performance, vec![0]);
        assert_eq!(classes.efficiency, vec![1]);
    }

    #[test]
    fn policy_application_is_best_effort_and_idempotent() {
        let classes = CpuClasses::detect();
        for _ in 0..2 {
            apply_thread_policy(&classes, ThreadRole::Background);
            apply_thread_policy(&classes, ThreadRole::Worker);
        }
        // No panic and no error surface: the policy is advisory.
    }
}
