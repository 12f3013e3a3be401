// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The runexcl.slice parent cgroup and its CPU reservation ledger.
//!
//! All invocations share one persistent slice directly under the cgroup v2
//! root. The slice's `cpuset.cpus.exclusive` file doubles as the reservation
//! ledger: while any invocation runs, it holds the union of all reserved
//! CPUs. Mutations happen under an exclusive flock on that file, which
//! serializes allocators against each other; the kernel independently rejects
//! partition creation for CPUs that are already exclusively held, which
//! arbitrates against partitions that are already running.

use crate::flock::AdvisoryLock;
use crate::sysfs;
use crate::Cpumask;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use std::path::Path;
use std::path::PathBuf;

/// Path to the cgroup v2 root.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Name of the parent slice under the cgroup root.
const SLICE_NAME: &str = "runexcl.slice";

/// Write '+cpuset' to the cgroup.subtree_control file under `cgroup` if the
/// controller is not already enabled there.
fn enable_cpuset_controller(cgroup: &Path) -> Result<()> {
    let subtree_control = cgroup.join("cgroup.subtree_control");
    if !sysfs::read(&subtree_control)?.contains("cpuset") {
        sysfs::write(&subtree_control, "+cpuset")?;
    }

    Ok(())
}

fn read_mask(path: &Path) -> Result<Cpumask> {
    let content = sysfs::read(path)?;
    let (mask, _) = Cpumask::from_cpulist_prefix(&content)
        .with_context(|| format!("Failed to parse CPU list from \"{}\"", path.display()))?;

    Ok(mask)
}

pub struct ExclusionSlice {
    path: PathBuf,
    effective: Cpumask,
}

impl ExclusionSlice {
    /// Make sure the runexcl.slice cgroup is set up under the default cgroup
    /// root.
    pub fn setup() -> Result<Self> {
        Self::setup_at(Path::new(CGROUP_ROOT))
    }

    /// Make sure the runexcl.slice cgroup under `cgroup_root` exists and has
    /// the cpuset controller enabled, and determine the CPUs it can use.
    /// Safe to call from concurrent invocations; every step is idempotent.
    pub fn setup_at(cgroup_root: &Path) -> Result<Self> {
        enable_cpuset_controller(cgroup_root)?;

        let path = cgroup_root.join(SLICE_NAME);
        if let Err(e) = std::fs::create_dir(&path) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(e)
                    .with_context(|| format!("Failed to create \"{}\"", path.display()));
            }
        }

        enable_cpuset_controller(&path)?;

        let effective = read_mask(&path.join("cpuset.cpus.effective"))?;

        // cgroup v2 refuses to create a remote partition unless the parent's
        // cpuset.cpus is populated, so seed it from the effective set if
        // nobody has done so yet.
        let cpus_path = path.join("cpuset.cpus");
        if read_mask(&cpus_path)?.is_empty() {
            sysfs::write(&cpus_path, effective.to_cpulist())?;
        }

        Ok(Self { path, effective })
    }

    /// Path of the slice directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The CPUs the kernel allows this slice to use.
    pub fn effective(&self) -> &Cpumask {
        &self.effective
    }

    fn ledger_path(&self) -> PathBuf {
        self.path.join("cpuset.cpus.exclusive")
    }

    /// Atomically add `requested` to the reservation ledger. Fails if the
    /// request is not a subset of the slice's effective CPUs. Overlap with
    /// existing reservations is deliberately not checked here: the kernel
    /// rejects the subsequent partition creation for CPUs that are already
    /// exclusively held.
    pub fn reserve(&self, requested: &Cpumask) -> Result<()> {
        let ledger_path = self.ledger_path();
        let _lock = AdvisoryLock::acquire(&ledger_path)?;

        let ledger = read_mask(&ledger_path)?;
        let available = read_mask(&self.path.join("cpuset.cpus.effective"))?;

        if !requested.is_subset_of(&available) {
            bail!(
                "Requested cpuset '{}' not a subset of '{}'",
                requested,
                available
            );
        }

        sysfs::write(&ledger_path, ledger.or(requested).to_cpulist())
    }

    /// Remove `reserved` from the reservation ledger, making the CPUs
    /// available to later invocations.
    pub fn release(&self, reserved: &Cpumask) -> Result<()> {
        let ledger_path = self.ledger_path();
        let _lock = AdvisoryLock::acquire(&ledger_path)?;

        // The ledger may list CPUs that are no longer effective (e.g. after
        // offlining), so compute the remainder from the ledger itself rather
        // than from cpuset.cpus.effective. There is no NOT on the file's
        // value to lean on, but (L ^ m) & L == L \ m.
        let ledger = read_mask(&ledger_path)?;
        let remaining = ledger.xor(reserved).and(&ledger);

        // The kernel rejects writing an empty mask to cpuset.cpus.exclusive.
        // Leave the stale value in place; it is ignored once no remote
        // partition references it, and availability is always computed from
        // cpuset.cpus.effective.
        if remaining.is_empty() {
            return Ok(());
        }

        sysfs::write(&ledger_path, remaining.to_cpulist())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Lay out a fake cgroup root the way the kernel would present it:
    /// the slice directory already exists and carries its interface files.
    pub(crate) fn fake_cgroup_root(effective: &str) -> TempDir {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("cgroup.subtree_control"), "").unwrap();

        let slice = tmp.path().join(SLICE_NAME);
        std::fs::create_dir(&slice).unwrap();
        std::fs::write(slice.join("cgroup.subtree_control"), "").unwrap();
        std::fs::write(
            slice.join("cpuset.cpus.effective"),
            format!("{}\n", effective),
        )
        .unwrap();
        std::fs::write(slice.join("cpuset.cpus"), "\n").unwrap();
        std::fs::write(slice.join("cpuset.cpus.exclusive"), "").unwrap();

        tmp
    }

    fn mask(cpulist: &str) -> Cpumask {
        Cpumask::from_cpulist(cpulist).unwrap()
    }

    #[test]
    fn test_setup_enables_controller() {
        let root = fake_cgroup_root("0-7");
        let slice = ExclusionSlice::setup_at(root.path()).unwrap();

        assert_eq!(slice.effective(), &mask("0-7"));
        assert_eq!(
            std::fs::read_to_string(root.path().join("cgroup.subtree_control")).unwrap(),
            "+cpuset"
        );
        assert_eq!(
            std::fs::read_to_string(root.path().join(SLICE_NAME).join("cgroup.subtree_control"))
                .unwrap(),
            "+cpuset"
        );
    }

    #[test]
    fn test_setup_seeds_cpus_from_effective() {
        let root = fake_cgroup_root("0-3");
        let slice = ExclusionSlice::setup_at(root.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(slice.path().join("cpuset.cpus")).unwrap(),
            "0-3"
        );
    }

    #[test]
    fn test_setup_is_idempotent() {
        let root = fake_cgroup_root("0-3");

        // Pretend a previous invocation already set everything up.
        std::fs::write(root.path().join("cgroup.subtree_control"), "cpuset cpu").unwrap();
        let slice_dir = root.path().join(SLICE_NAME);
        std::fs::write(slice_dir.join("cgroup.subtree_control"), "cpuset").unwrap();
        std::fs::write(slice_dir.join("cpuset.cpus"), "0-3\n").unwrap();

        let slice = ExclusionSlice::setup_at(root.path()).unwrap();
        assert_eq!(slice.effective(), &mask("0-3"));

        // Nothing was rewritten.
        assert_eq!(
            std::fs::read_to_string(root.path().join("cgroup.subtree_control")).unwrap(),
            "cpuset cpu"
        );
        assert_eq!(
            std::fs::read_to_string(slice_dir.join("cpuset.cpus")).unwrap(),
            "0-3\n"
        );
    }

    #[test]
    fn test_reserve_updates_ledger() {
        let root = fake_cgroup_root("0-3");
        let slice = ExclusionSlice::setup_at(root.path()).unwrap();

        slice.reserve(&mask("1-2")).unwrap();
        assert_eq!(
            std::fs::read_to_string(slice.ledger_path()).unwrap(),
            "1-2"
        );

        slice.reserve(&mask("0")).unwrap();
        assert_eq!(
            std::fs::read_to_string(slice.ledger_path()).unwrap(),
            "0-2"
        );
    }

    #[test]
    fn test_reserve_rejects_unavailable_cpus() {
        let root = fake_cgroup_root("0-3");
        let slice = ExclusionSlice::setup_at(root.path()).unwrap();

        let err = slice.reserve(&mask("2-5")).unwrap_err();
        assert!(format!("{:#}", err).contains("not a subset"));
        // The ledger is untouched on failure.
        assert_eq!(std::fs::read_to_string(slice.ledger_path()).unwrap(), "");
    }

    #[test]
    fn test_release_removes_reservation() {
        let root = fake_cgroup_root("0-7");
        let slice = ExclusionSlice::setup_at(root.path()).unwrap();

        std::fs::write(slice.ledger_path(), "0-7\n").unwrap();
        slice.release(&mask("2-3")).unwrap();
        assert_eq!(
            std::fs::read_to_string(slice.ledger_path()).unwrap(),
            "0-1,4-7"
        );
    }

    #[test]
    fn test_release_last_reservation_keeps_stale_value() {
        let root = fake_cgroup_root("0-3");
        let slice = ExclusionSlice::setup_at(root.path()).unwrap();

        slice.reserve(&mask("1-2")).unwrap();
        slice.release(&mask("1-2")).unwrap();

        // The kernel refuses an empty exclusive mask, so the last value
        // stays behind.
        assert_eq!(
            std::fs::read_to_string(slice.ledger_path()).unwrap(),
            "1-2"
        );
    }

    #[test]
    fn test_reserve_release_cycle_restores_ledger() {
        let root = fake_cgroup_root("0-7");
        let slice = ExclusionSlice::setup_at(root.path()).unwrap();

        std::fs::write(slice.ledger_path(), "0,7\n").unwrap();
        slice.reserve(&mask("2-3")).unwrap();
        assert_eq!(
            std::fs::read_to_string(slice.ledger_path()).unwrap(),
            "0,2-3,7"
        );

        slice.release(&mask("2-3")).unwrap();
        assert_eq!(
            std::fs::read_to_string(slice.ledger_path()).unwrap(),
            "0,7"
        );
    }
}
