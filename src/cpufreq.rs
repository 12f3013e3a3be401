// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! CPU frequency pinning through the cpufreq `userspace` governor.
//!
//! For every cpufreq policy whose `affected_cpus` intersects the reserved
//! mask, the controller records the current governor and setpoint, switches
//! the governor to `userspace`, and programs the requested frequency. On
//! restore everything is written back, setpoint before governor so the
//! kernel's own control loop only re-engages once its state is back.
//!
//! The only supported scaling driver is AMD P-state, which must be switched
//! to `passive` mode before the `userspace` governor takes effect (see
//! <https://docs.kernel.org/admin-guide/pm/amd-pstate.html>). The driver
//! status is recorded before any policy is touched and restored after every
//! policy has been, since the recorded policy state is only meaningful in
//! passive mode.

use crate::sysfs;
use crate::Cpumask;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::warn;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

/// Path to the cpu subsystem root.
const CPU_ROOT: &str = "/sys/devices/system/cpu";

/// Relative path of the AMD P-state driver status file.
const AMD_PSTATE_STATUS: &str = "amd_pstate/status";

/// Value reported by scaling_setspeed when the current governor is not
/// `userspace`. Must not be written back.
const SETSPEED_UNSUPPORTED: &str = "<unsupported>";

/// A requested operating frequency for the reserved CPUs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FrequencyRequest {
    /// Exact frequency in kHz, clamped up to the policy's scaling_min_freq.
    Exact(u64),
    /// Fraction of the policy's scaling_max_freq, in (0.0, 1.0].
    Fraction(f64),
    /// The policy's scaling_max_freq.
    Max,
    /// The policy's scaling_min_freq.
    Min,
    /// The driver's lowest nonlinear frequency, below which power scaling
    /// becomes non-linear. Falls back to scaling_min_freq on drivers that do
    /// not report one.
    LowestNonlinear,
}

impl FromStr for FrequencyRequest {
    type Err = anyhow::Error;

    /// Accepts `max`, `min`, `nonlinear`, or a positive number with an
    /// optional `k`/`kHz`, `M`/`MHz`, or `G`/`GHz` suffix. A bare number of
    /// at most 1.0 is a fraction of the maximum frequency; anything larger
    /// is kHz.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "max" => return Ok(Self::Max),
            "min" => return Ok(Self::Min),
            "nonlinear" => return Ok(Self::LowestNonlinear),
            _ => {}
        }

        let split = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let value = s[..split]
            .parse::<f64>()
            .map_err(|_| anyhow::anyhow!("Invalid CPU frequency argument '{}'", s))?;
        if value <= 0.0 {
            bail!("Invalid CPU frequency argument '{}'", s);
        }

        let khz_factor = match &s[split..] {
            "" => {
                return Ok(if value <= 1.0 {
                    Self::Fraction(value)
                } else {
                    Self::Exact(value as u64)
                });
            }
            "k" | "kHz" => 1.0,
            "M" | "MHz" => 1000.0,
            "G" | "GHz" => 1000000.0,
            unit => bail!("Unknown CPU frequency unit '{}'", unit),
        };

        Ok(Self::Exact((value * khz_factor) as u64))
    }
}

/// Saved state of one cpufreq policy directory.
struct Policy {
    path: PathBuf,
    saved_governor: String,
    saved_setspeed: String,
    min_freq: u64,
    max_freq: u64,
    lowest_nonlinear_freq: Option<u64>,
}

impl Policy {
    fn record(path: PathBuf, record_nonlinear: bool) -> Result<Self> {
        let saved_governor = sysfs::read_value(&path.join("scaling_governor"))?;
        let saved_setspeed = sysfs::read_value(&path.join("scaling_setspeed"))?;
        let min_freq = sysfs::read_u64(&path.join("scaling_min_freq"))?;
        let max_freq = sysfs::read_u64(&path.join("scaling_max_freq"))?;
        let lowest_nonlinear_freq = if record_nonlinear {
            Some(sysfs::read_u64(
                &path.join("amd_pstate_lowest_nonlinear_freq"),
            )?)
        } else {
            None
        };

        Ok(Self {
            path,
            saved_governor,
            saved_setspeed,
            min_freq,
            max_freq,
            lowest_nonlinear_freq,
        })
    }

    /// Map a request to a concrete setpoint for this policy, in kHz.
    fn setpoint(&self, request: FrequencyRequest) -> u64 {
        let khz = match request {
            FrequencyRequest::Exact(khz) => khz,
            FrequencyRequest::Fraction(frac) => (self.max_freq as f64 * frac) as u64,
            FrequencyRequest::Max => self.max_freq,
            FrequencyRequest::Min => self.min_freq,
            FrequencyRequest::LowestNonlinear => {
                self.lowest_nonlinear_freq.unwrap_or(self.min_freq)
            }
        };

        khz.max(self.min_freq)
    }

    fn apply(&self, request: FrequencyRequest) -> Result<()> {
        // The governor must be userspace before setspeed is writable.
        sysfs::write(&self.path.join("scaling_governor"), "userspace")?;
        sysfs::write(&self.path.join("scaling_setspeed"), self.setpoint(request))
    }

    fn restore(&self) -> Result<()> {
        if self.saved_setspeed != SETSPEED_UNSUPPORTED {
            sysfs::write(&self.path.join("scaling_setspeed"), &self.saved_setspeed)?;
        }
        // Restoring the governor last re-engages the kernel's control loop.
        sysfs::write(&self.path.join("scaling_governor"), &self.saved_governor)
    }
}

/// The detected scaling driver and whatever state had to be saved to put it
/// into a mode where the `userspace` governor works.
enum Driver {
    AmdPstate { saved_status: String },
}

pub struct FrequencyController {
    cpu_root: PathBuf,
    driver: Driver,
    policies: Vec<Policy>,
    restored: bool,
}

impl FrequencyController {
    /// Detect the scaling driver and prepare it for userspace frequency
    /// selection. Returns `None` when no supported driver is present.
    pub fn detect() -> Result<Option<Self>> {
        Self::detect_at(Path::new(CPU_ROOT))
    }

    pub fn detect_at(cpu_root: &Path) -> Result<Option<Self>> {
        let status_path = cpu_root.join(AMD_PSTATE_STATUS);
        if !status_path.exists() {
            return Ok(None);
        }

        let saved_status = sysfs::change(&status_path, "passive")?;
        Ok(Some(Self {
            cpu_root: cpu_root.to_path_buf(),
            driver: Driver::AmdPstate { saved_status },
            policies: Vec::new(),
            restored: false,
        }))
    }

    /// Record and reprogram every policy that covers a CPU in `cpus`.
    pub fn set_frequency(&mut self, cpus: &Cpumask, request: FrequencyRequest) -> Result<()> {
        self.setup_policies(cpus)?;
        for policy in &self.policies {
            policy.apply(request)?;
        }

        Ok(())
    }

    fn setup_policies(&mut self, cpus: &Cpumask) -> Result<()> {
        let record_nonlinear = match self.driver {
            Driver::AmdPstate { .. } => true,
        };

        let cpufreq_root = self.cpu_root.join("cpufreq");
        let entries = std::fs::read_dir(&cpufreq_root)
            .with_context(|| format!("Failed to read \"{}\"", cpufreq_root.display()))?;

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("Failed to read \"{}\"", cpufreq_root.display()))?
                .path();
            if !path.is_dir() {
                continue;
            }
            match path.file_name().and_then(|n| n.to_str()) {
                Some(name) if name.contains("policy") => paths.push(path),
                _ => continue,
            }
        }
        paths.sort();

        for path in paths {
            let affected = Cpumask::from_cpu_words(&sysfs::read(&path.join("affected_cpus"))?)
                .with_context(|| {
                    format!("Failed to parse affected_cpus of \"{}\"", path.display())
                })?;
            // One record per policy covers every CPU the policy manages.
            if !affected.and(cpus).is_empty() {
                self.policies.push(Policy::record(path, record_nonlinear)?);
            }
        }

        Ok(())
    }

    /// Write back every touched policy, then the driver status. Errors are
    /// reported but do not stop the remaining restores.
    pub fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;

        let mut result = Ok(());
        for policy in &self.policies {
            if let Err(e) = policy.restore() {
                warn!("Failed to restore \"{}\": {:#}", policy.path.display(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        // The policies were recorded with the driver in passive mode, so the
        // original driver status goes back only after all of them.
        let Driver::AmdPstate { saved_status } = &self.driver;
        let status_path = self.cpu_root.join(AMD_PSTATE_STATUS);
        if let Err(e) = sysfs::write(&status_path, saved_status) {
            warn!("Failed to restore driver status: {:#}", e);
            if result.is_ok() {
                result = Err(e);
            }
        }

        result
    }
}

impl Drop for FrequencyController {
    fn drop(&mut self) {
        // restore() logs the interesting failures itself.
        let _ = self.restore();
    }
}
