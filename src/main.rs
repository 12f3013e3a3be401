// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Launch a command on exclusively owned CPUs.
//!
//! The parent claims the CPUs (reservation ledger, cpuset partition,
//! optionally pinned frequency) and clones the child directly into the fresh
//! cgroup. The child drops privileges and execs; the parent waits for the
//! child and for the cgroup to drain, then unwinds everything it set up.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::debug;
use log::error;
use log::warn;
use nix::sched::sched_setaffinity;
use nix::sched::CpuSet;
use nix::sys::signal::SigSet;
use nix::sys::signal::SigmaskHow;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::sys::wait::WaitStatus;
use nix::unistd::execvp;
use nix::unistd::getgid;
use nix::unistd::getuid;
use nix::unistd::setgid;
use nix::unistd::setuid;
use nix::unistd::ForkResult;
use nix::unistd::Pid;
use runexcl::CpuCGroup;
use runexcl::Cpumask;
use runexcl::ExclusionSlice;
use runexcl::FrequencyController;
use runexcl::FrequencyRequest;
use std::ffi::CString;
use std::os::fd::AsRawFd;

#[derive(Debug, clap::Parser)]
#[command(
    name = "runexcl",
    version,
    about = "Run a command with exclusive ownership of a set of CPUs."
)]
struct Opts {
    /// CPUs to run the command on, in cpulist form (e.g. '0-2,4'). May be
    /// given multiple times; the lists are united.
    #[clap(short = 'c', long = "cpu-list", value_name = "LIST", required = true)]
    cpu_list: Vec<String>,

    /// Frequency to pin the CPUs to: a value in kHz (optionally with a
    /// k/M/G suffix), a fraction (0 < f <= 1) of the maximum frequency, or
    /// one of max, min, nonlinear.
    #[clap(short = 'f', long, value_name = "FREQ")]
    frequency: Option<FrequencyRequest>,

    /// Additionally remove the CPUs from the kernel scheduler's
    /// load-balancing domains.
    #[clap(short = 'i', long)]
    isolate: bool,

    /// Enable verbose output.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Command to run, with its arguments.
    #[clap(trailing_var_arg = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn init_logging(opts: &Opts) -> Result<()> {
    let loglevel = if opts.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )
    .context("Failed to initialize logging")
}

fn main() {
    let opts = Opts::parse();
    if let Err(e) = init_logging(&opts) {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }

    match run(&opts) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(opts: &Opts) -> Result<i32> {
    let mut requested = Cpumask::new();
    for list in &opts.cpu_list {
        requested |= &Cpumask::from_cpulist(list)
            .with_context(|| format!("Invalid CPU specification '{}'", list))?;
    }
    if requested.is_empty() {
        bail!("No CPUs specified");
    }

    // Block the termination signals before claiming any resource, so that a
    // ^C lands in the child and the parent always reaches its teardown.
    // SIGQUIT stays unblocked on purpose: it kills the parent without any
    // cleanup, as an escape hatch for debugging.
    let mut blocked = SigSet::empty();
    blocked.add(Signal::SIGINT);
    blocked.add(Signal::SIGTERM);
    blocked.add(Signal::SIGHUP);
    let saved_sigmask = blocked
        .thread_swap_mask(SigmaskHow::SIG_SETMASK)
        .context("Failed to set signal mask")?;

    let slice = ExclusionSlice::setup()?;
    if !requested.is_subset_of(slice.effective()) {
        bail!("cpuset must be within '{}'", slice.effective());
    }

    let group = CpuCGroup::create(&slice, requested.clone())?;
    debug!("created cpuset partition at \"{}\"", group.path().display());
    if opts.isolate {
        group.isolate(true)?;
    }

    let frequency = opts
        .frequency
        .and_then(|request| apply_frequency(&requested, request));

    // CLONE_VFORK: the parent has nothing to do until the child execs, and
    // suspending it until then closes the window where a signal arriving
    // between clone and exec would be handled by neither process.
    let child = match unsafe { group.clone_into(libc::CLONE_VFORK as u64) }? {
        ForkResult::Child => run_child(&requested, &saved_sigmask, &opts.command),
        ForkResult::Parent { child } => child,
    };

    let status = waitpid(child, None).context("waitpid() failed")?;

    // The child may have forked children of its own that outlived it; the
    // partition cannot be dismantled until every descendant is gone.
    group.wait_empty()?;

    if let Some(mut frequency) = frequency {
        // Restore failures are logged by the controller itself.
        let _ = frequency.restore();
    }
    if let Err(e) = group.close() {
        warn!("{:#}", e);
    }

    Ok(exit_code(status))
}

/// A frequency request that cannot be satisfied is reported but does not
/// abort the launch.
fn apply_frequency(cpus: &Cpumask, request: FrequencyRequest) -> Option<FrequencyController> {
    let mut ctrl = match FrequencyController::detect() {
        Ok(Some(ctrl)) => ctrl,
        Ok(None) => {
            warn!("Failed to set CPU frequency: no supported scaling driver");
            return None;
        }
        Err(e) => {
            warn!("Failed to set CPU frequency: {:#}", e);
            return None;
        }
    };

    match ctrl.set_frequency(cpus, request) {
        Ok(()) => Some(ctrl),
        Err(e) => {
            warn!("Failed to set CPU frequency: {:#}", e);
            // Dropping the controller puts back whatever was already changed.
            None
        }
    }
}

fn run_child(cpus: &Cpumask, saved_sigmask: &SigSet, command: &[String]) -> ! {
    if let Err(e) = exec_command(cpus, saved_sigmask, command) {
        eprintln!("{:#}", e);
    }

    // _exit, not exit: the parent owns the cgroup, the reservation and the
    // frequency state, and no destructor here may touch them.
    unsafe { libc::_exit(1) }
}

fn exec_command(cpus: &Cpumask, saved_sigmask: &SigSet, command: &[String]) -> Result<()> {
    // The cgroup already restricts the child; pinning the affinity as well
    // means a later change to the partition cannot silently widen it.
    let mut cpuset = CpuSet::new();
    for cpu in cpus.iter() {
        cpuset
            .set(cpu)
            .with_context(|| format!("Cannot pin CPU {}", cpu))?;
    }
    sched_setaffinity(Pid::from_raw(0), &cpuset).context("sched_setaffinity() failed")?;

    // runexcl is meant to be installed set-uid root; the command must run as
    // the invoking user. The group has to go first, it cannot be dropped
    // anymore once the uid is gone.
    setgid(getgid()).context("Could not drop group privileges")?;
    setuid(getuid()).context("Could not drop user privileges")?;

    close_inherited_fds()?;

    // Give the command the signal mask the caller had.
    saved_sigmask
        .thread_set_mask()
        .context("Failed to restore signal mask")?;

    let program = CString::new(command[0].as_str())?;
    let args = command
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<Vec<_>, _>>()?;
    let _ = execvp(&program, &args)
        .with_context(|| format!("Failed to execute '{}'", command[0]))?;
    unreachable!("execvp returned without error");
}

/// Close every inherited descriptor above stderr. Not everything the parent
/// (or whatever exec'd the parent) opened is guaranteed to carry CLOEXEC.
fn close_inherited_fds() -> Result<()> {
    let mut dir = nix::dir::Dir::open(
        "/proc/self/fd",
        nix::fcntl::OFlag::O_RDONLY | nix::fcntl::OFlag::O_DIRECTORY,
        nix::sys::stat::Mode::empty(),
    )
    .context("Failed to open /proc/self/fd")?;
    let dir_fd = dir.as_raw_fd();

    // Collect first: closing descriptors while iterating mutates the very
    // directory being read.
    let fds: Vec<libc::c_int> = dir
        .iter()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().ok()?.parse().ok())
        .collect();

    for fd in fds {
        if fd > 2 && fd != dir_fd {
            unsafe { libc::close(fd) };
        }
    }

    Ok(())
}

fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        // waitpid without WUNTRACED/WCONTINUED only reports the above.
        _ => 1,
    }
}
