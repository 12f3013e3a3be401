// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # runexcl
//!
//! Run a command on a caller-chosen subset of host CPUs with exclusive
//! ownership of those CPUs for the duration of the command.
//!
//! Exclusivity is built on the cgroup v2 cpuset controller: a persistent
//! parent slice (`/sys/fs/cgroup/runexcl.slice`) tracks which CPUs are
//! currently leased to any running invocation, and each invocation creates a
//! child cpuset partition of type `root` (or `isolated`) carrying its CPUs.
//! The command is spawned directly into the fresh cgroup with
//! `clone3(CLONE_INTO_CGROUP)`. Optionally the CPUs' operating frequency is
//! pinned through the cpufreq `userspace` governor and restored afterwards.

mod cpumask;
pub use cpumask::Cpumask;
pub use cpumask::NR_CPU_IDS;

pub mod sysfs;

mod flock;
pub use flock::AdvisoryLock;

mod watcher;
pub use watcher::ChangeWatcher;

mod slice;
pub use slice::ExclusionSlice;
pub use slice::CGROUP_ROOT;

mod cgroup;
pub use cgroup::CpuCGroup;
pub use cgroup::PartitionType;

mod cpufreq;
pub use cpufreq::FrequencyController;
pub use cpufreq::FrequencyRequest;
