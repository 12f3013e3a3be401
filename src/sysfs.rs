// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Helpers for the small text files exposed by sysfs and cgroupfs. Every
//! failure names the path it happened on; kernel interface files produce
//! useless bare errno messages otherwise.

use anyhow::Context;
use anyhow::Result;
use std::fmt::Display;
use std::path::Path;

/// Read the entire contents of a small virtual file.
pub fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read from \"{}\"", path.display()))
}

/// Read a single value, trimming surrounding whitespace.
pub fn read_value(path: &Path) -> Result<String> {
    Ok(read(path)?.trim().to_string())
}

/// Read and parse a single decimal value.
pub fn read_u64(path: &Path) -> Result<u64> {
    let val = read_value(path)?;
    val.parse::<u64>()
        .with_context(|| format!("Failed to parse '{}' from \"{}\"", val, path.display()))
}

/// Overwrite a virtual file with a single value.
pub fn write<T: Display>(path: &Path, value: T) -> Result<()> {
    std::fs::write(path, value.to_string())
        .with_context(|| format!("Failed to write to \"{}\"", path.display()))
}

/// Read the current value of a virtual file, then replace it. Returns the
/// previous (trimmed) value.
pub fn change<T: Display>(path: &Path, value: T) -> Result<String> {
    let old = read_value(path)?;
    write(path, value)?;
    Ok(old)
}
