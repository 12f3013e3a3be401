// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Single-file change notification. Wraps an inotify instance watching one
//! file for modification and exposes a blocking wait for the next event.

use anyhow::Context;
use anyhow::Result;
use inotify::Inotify;
use inotify::WatchMask;
use std::path::Path;

pub struct ChangeWatcher {
    inotify: Inotify,
}

impl ChangeWatcher {
    /// Start watching `path` for modification events.
    pub fn new(path: &Path) -> Result<Self> {
        let inotify = Inotify::init().context("Failed to initialize inotify")?;
        inotify
            .watches()
            .add(path, WatchMask::MODIFY)
            .with_context(|| format!("Failed to watch \"{}\"", path.display()))?;

        Ok(Self { inotify })
    }

    /// Block until at least one change event has been delivered.
    pub fn wait(&mut self) -> Result<()> {
        // Events for a watched file have no name payload, so a small buffer
        // always fits at least one event.
        let mut buffer = [0u8; 256];
        loop {
            match self.inotify.read_events_blocking(&mut buffer) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("Failed to read inotify events"),
            }
        }
    }
}
