// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-invocation cpuset partition under runexcl.slice.
//!
//! A `CpuCGroup` is a child cgroup named `runexcl.<cpulist>` whose CPUs are
//! reserved in the slice's ledger for its whole lifetime. Creation follows
//! the ordering cgroup v2 demands: reserve, mkdir, populate `cpuset.cpus`,
//! then flip `cpuset.cpus.partition` to `root` and verify the kernel
//! accepted it (the readback is the only place the kernel reports *why* a
//! partition was refused). Any failure along the way unwinds what was
//! already done.

use crate::slice::ExclusionSlice;
use crate::sysfs;
use crate::watcher::ChangeWatcher;
use crate::Cpumask;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::warn;
use nix::errno::Errno;
use nix::unistd::ForkResult;
use nix::unistd::Pid;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PartitionType {
    Root,
    Isolated,
}

impl PartitionType {
    fn as_str(&self) -> &'static str {
        match self {
            PartitionType::Root => "root",
            PartitionType::Isolated => "isolated",
        }
    }
}

pub struct CpuCGroup<'a> {
    slice: &'a ExclusionSlice,
    path: PathBuf,
    cpus: Cpumask,
    torn_down: bool,
}

impl<'a> CpuCGroup<'a> {
    /// Reserve `cpus` in the slice's ledger and create a cpuset partition of
    /// type `root` carrying them. On any failure the reservation is released
    /// and the directory, if it was created, is removed.
    pub fn create(slice: &'a ExclusionSlice, cpus: Cpumask) -> Result<Self> {
        slice.reserve(&cpus)?;

        let path = slice.path().join(format!("runexcl.{}", cpus.to_cpulist()));
        if let Err(e) = std::fs::create_dir(&path) {
            if let Err(release_err) = slice.release(&cpus) {
                warn!("Failed to release reservation: {:#}", release_err);
            }
            return Err(e).with_context(|| format!("Failed to create \"{}\"", path.display()));
        }

        let group = Self {
            slice,
            path,
            cpus,
            torn_down: false,
        };

        // Dropping the half-built group removes the directory and releases
        // the reservation.
        group.configure()?;
        Ok(group)
    }

    fn configure(&self) -> Result<()> {
        sysfs::write(&self.path.join("cpuset.cpus"), self.cpus.to_cpulist())?;
        self.set_partition_type(PartitionType::Root)
    }

    /// Path of the cgroup directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The CPUs owned by this group.
    pub fn cpus(&self) -> &Cpumask {
        &self.cpus
    }

    fn set_partition_type(&self, partition: PartitionType) -> Result<()> {
        let path = self.path.join("cpuset.cpus.partition");
        sysfs::write(&path, partition.as_str())?;

        // The write itself succeeds even when the kernel refuses the
        // partition; the verdict only shows up in the readback, e.g.
        // "root invalid (Cpu list in cpuset.cpus not exclusive)".
        let readback = sysfs::read_value(&path)?;
        if readback != partition.as_str() {
            bail!(
                "Could not set partition type of \"{}\" to '{}': {}",
                self.path.display(),
                partition.as_str(),
                readback
            );
        }

        Ok(())
    }

    /// Additionally remove the group's CPUs from the kernel scheduler's
    /// load-balancing domains, or put them back.
    pub fn isolate(&self, enable: bool) -> Result<()> {
        self.set_partition_type(if enable {
            PartitionType::Isolated
        } else {
            PartitionType::Root
        })
    }

    /// Move an existing process into the group.
    pub fn attach(&self, pid: Pid) -> Result<()> {
        sysfs::write(&self.path.join("cgroup.procs"), pid)
    }

    /// Clone a child process directly into the cgroup with
    /// `clone3(CLONE_INTO_CGROUP)`. `extra_flags` is forwarded verbatim to
    /// the syscall; the kernel documents which CLONE_* flags are valid in
    /// combination with CLONE_INTO_CGROUP.
    ///
    /// # Safety
    ///
    /// Same contract as [`nix::unistd::fork`]: in a multithreaded process the
    /// child may only call async-signal-safe functions until it execs.
    pub unsafe fn clone_into(&self, extra_flags: u64) -> Result<ForkResult> {
        // An O_PATH descriptor is all CLONE_INTO_CGROUP needs. Not CLOEXEC:
        // it is closed explicitly in both the parent and the child below.
        let dir = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_PATH)
            .open(&self.path)
            .with_context(|| format!("Failed to open \"{}\"", self.path.display()))?;

        let mut args: libc::clone_args = unsafe { std::mem::zeroed() };
        args.flags = libc::CLONE_INTO_CGROUP as u64 | extra_flags;
        args.exit_signal = libc::SIGCHLD as u64;
        args.cgroup = dir.as_raw_fd() as u64;

        let ret = unsafe {
            libc::syscall(
                libc::SYS_clone3,
                &args as *const libc::clone_args,
                std::mem::size_of::<libc::clone_args>(),
            )
        };

        // The child resumes here as well; this drop closes the descriptor on
        // both sides.
        drop(dir);

        match ret {
            -1 => Err(Errno::last()).context("clone3() failed"),
            0 => Ok(ForkResult::Child),
            pid => Ok(ForkResult::Parent {
                child: Pid::from_raw(pid as libc::pid_t),
            }),
        }
    }

    /// Block until the cgroup holds no processes at all. The direct child
    /// may exit while grand-children it forked live on; the group cannot be
    /// removed until those are gone too, so watch `cgroup.events` until its
    /// `populated` key reads 0.
    pub fn wait_empty(&self) -> Result<()> {
        let events_path = self.path.join("cgroup.events");
        let mut events = std::fs::File::open(&events_path)
            .with_context(|| format!("Failed to open \"{}\"", events_path.display()))?;
        let mut watcher = ChangeWatcher::new(&events_path)?;

        loop {
            events.seek(SeekFrom::Start(0))?;
            let mut content = String::new();
            events.read_to_string(&mut content)?;

            match parse_populated(&content) {
                Some(0) => return Ok(()),
                Some(_) => watcher.wait()?,
                None => bail!(
                    "Unexpected content in \"{}\": '{}'",
                    events_path.display(),
                    content.trim_end()
                ),
            }
        }
    }

    /// Remove the cgroup and release its CPUs back to the slice. Errors that
    /// `Drop` could only log are surfaced here.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        // If the directory cannot be removed the partition may still be
        // alive, so the reservation must stand: releasing it would let a
        // peer hand out CPUs the kernel still considers exclusive.
        std::fs::remove_dir(&self.path)
            .with_context(|| format!("Failed to remove \"{}\"", self.path.display()))?;

        self.slice.release(&self.cpus)
    }
}

impl Drop for CpuCGroup<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("Failed to tear down \"{}\": {:#}", self.path.display(), e);
        }
    }
}

fn parse_populated(content: &str) -> Option<u64> {
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("populated ") {
            return value.trim().parse().ok();
        }
    }

    None
}
