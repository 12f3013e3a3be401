// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scoped exclusive advisory lock on a file. Acquisition blocks until the
//! lock is granted, retrying on signal interruption; the lock is dropped
//! together with the guard.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use nix::errno::Errno;
use nix::fcntl::Flock;
use nix::fcntl::FlockArg;
use std::fs::File;
use std::path::Path;

pub struct AdvisoryLock {
    _lock: Flock<File>,
}

impl AdvisoryLock {
    /// Open `path` read-only and take an exclusive advisory lock on it,
    /// blocking until the lock is available.
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .with_context(|| format!("Failed to open \"{}\" for locking", path.display()))?;

        loop {
            match Flock::lock(file, FlockArg::LockExclusive) {
                Ok(lock) => return Ok(Self { _lock: lock }),
                Err((retry, Errno::EINTR)) => file = retry,
                Err((_, errno)) => {
                    bail!("Failed to lock \"{}\": {}", path.display(), errno);
                }
            }
        }
    }
}
