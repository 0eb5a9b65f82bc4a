//! Process Lifecycle Controller.
//!
//! Benchmarks are forked in a stopped state so counters can be attached
//! before the target runs a single instruction of its own, resumed once the
//! measurement is armed, and reaped from a SIGCHLD handler.
//!
//! The handler and the main flow only share the [`ReapTable`]: per-slot
//! atomics plus the [`Completion`] running count and `done` flag.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering,
};

use anyhow::{bail, Context, Result};

use crate::clock::{Clock, MonotonicClock};
use crate::label::{BenchmarkLabel, Labeler};
use crate::signals::{self, SignalBlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Unstarted = 0,
    SpawnedPaused = 1,
    Running = 2,
    Terminated = 3,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SlotState::SpawnedPaused,
            2 => SlotState::Running,
            3 => SlotState::Terminated,
            _ => SlotState::Unstarted,
        }
    }
}

/// Number of live benchmarks and the flag raised when it drops to zero.
#[derive(Debug, Default)]
pub struct Completion {
    running: AtomicUsize,
    done: AtomicBool,
    completions: AtomicUsize,
}

impl Completion {
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// How many times the running count has reached zero.
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    fn add(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
        self.done.store(false, Ordering::SeqCst);
    }

    /// Returns true when this call brought the count to zero.
    fn finish_one(&self) -> bool {
        if self.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.completions.fetch_add(1, Ordering::SeqCst);
            self.done.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }
}

#[derive(Debug, Default)]
struct Slot {
    pid: AtomicI32,
    state: AtomicU8,
    launched: AtomicU64,
    start: AtomicU64,
    elapsed: AtomicU64,
    exit_code: AtomicI32,
}

/// One `waitpid` result as the reap loop sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    Exited { pid: libc::pid_t, status: libc::c_int },
    /// Children exist but none changed state.
    Pending,
    NoChildren,
    Failed(libc::c_int),
}

pub trait ChildWaiter {
    fn wait_any(&mut self) -> WaitEvent;
}

/// `waitpid(-1, WNOHANG)`.
#[derive(Debug, Default)]
pub struct SysWaiter;

impl ChildWaiter for SysWaiter {
    fn wait_any(&mut self) -> WaitEvent {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        match pid {
            0 => WaitEvent::Pending,
            -1 => match errno() {
                libc::ECHILD => WaitEvent::NoChildren,
                e => WaitEvent::Failed(e),
            },
            pid => WaitEvent::Exited { pid, status },
        }
    }
}

fn errno() -> libc::c_int {
    unsafe { *libc::__errno_location() }
}

fn set_errno(value: libc::c_int) {
    unsafe { *libc::__errno_location() = value };
}

/// Shell-style exit code: the exit status, or 128 + signal number.
pub fn exit_code_of(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        -1
    }
}

/// Per-benchmark state touched by the SIGCHLD handler.
///
/// Sized once up front; the handler never allocates.
#[derive(Debug)]
pub struct ReapTable {
    slots: Box<[Slot]>,
    completion: Completion,
    unknown_children: AtomicUsize,
}

impl ReapTable {
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot::default()).collect::<Vec<_>>();
        ReapTable {
            slots: slots.into_boxed_slice(),
            completion: Completion::default(),
            unknown_children: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    /// Children reaped that were never claimed by a slot.
    pub fn unknown_children(&self) -> usize {
        self.unknown_children.load(Ordering::SeqCst)
    }

    /// Take the next unused slot for a freshly spawned, paused child.
    ///
    /// Must run with SIGCHLD blocked.
    pub fn claim(&self, pid: libc::pid_t, start: u64) -> Result<usize> {
        let Some(index) = self
            .slots
            .iter()
            .position(|s| s.state.load(Ordering::SeqCst) == SlotState::Unstarted as u8)
        else {
            bail!("All {} benchmark slots are in use", self.slots.len());
        };
        let slot = &self.slots[index];
        slot.pid.store(pid, Ordering::SeqCst);
        slot.launched.store(start, Ordering::SeqCst);
        slot.start.store(start, Ordering::SeqCst);
        slot.elapsed.store(0, Ordering::SeqCst);
        slot.exit_code.store(0, Ordering::SeqCst);
        slot.state.store(SlotState::SpawnedPaused as u8, Ordering::SeqCst);
        self.completion.add();
        Ok(index)
    }

    /// Move a paused slot to running and restamp its start time. Elapsed
    /// time counts from here; the launch time is kept separately.
    pub fn mark_running(&self, index: usize, start: u64) -> bool {
        let slot = &self.slots[index];
        let resumed = slot
            .state
            .compare_exchange(
                SlotState::SpawnedPaused as u8,
                SlotState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if resumed {
            slot.start.store(start, Ordering::SeqCst);
        }
        resumed
    }

    pub fn state(&self, index: usize) -> SlotState {
        SlotState::from_u8(self.slots[index].state.load(Ordering::SeqCst))
    }

    pub fn pid(&self, index: usize) -> libc::pid_t {
        self.slots[index].pid.load(Ordering::SeqCst)
    }

    pub fn launched_at(&self, index: usize) -> u64 {
        self.slots[index].launched.load(Ordering::SeqCst)
    }

    pub fn start(&self, index: usize) -> u64 {
        self.slots[index].start.load(Ordering::SeqCst)
    }

    /// Elapsed nanoseconds and exit code, once the slot is terminated.
    pub fn outcome(&self, index: usize) -> Option<(u64, i32)> {
        let slot = &self.slots[index];
        if slot.state.load(Ordering::SeqCst) != SlotState::Terminated as u8 {
            return None;
        }
        Some((
            slot.elapsed.load(Ordering::SeqCst),
            slot.exit_code.load(Ordering::SeqCst),
        ))
    }

    fn live_slot(&self, pid: libc::pid_t) -> Option<&Slot> {
        self.slots.iter().find(|s| {
            let state = s.state.load(Ordering::SeqCst);
            (state == SlotState::SpawnedPaused as u8 || state == SlotState::Running as u8)
                && s.pid.load(Ordering::SeqCst) == pid
        })
    }

    /// Reap every child that has terminated.
    ///
    /// SIGCHLD is not queued, so one delivery may stand for several exits;
    /// the loop keeps waiting until nothing is pending. Returns the number of
    /// children reaped, or the errno of a failed wait.
    pub fn drain<W: ChildWaiter, C: Clock>(
        &self,
        waiter: &mut W,
        clock: &C,
    ) -> std::result::Result<usize, libc::c_int> {
        let mut reaped = 0;
        loop {
            match waiter.wait_any() {
                WaitEvent::Pending | WaitEvent::NoChildren => return Ok(reaped),
                WaitEvent::Failed(e) => return Err(e),
                WaitEvent::Exited { pid, status } => {
                    let end = clock.now();
                    reaped += 1;
                    let Some(slot) = self.live_slot(pid) else {
                        self.unknown_children.fetch_add(1, Ordering::SeqCst);
                        continue;
                    };
                    let start = slot.start.load(Ordering::SeqCst);
                    slot.elapsed.store(end.saturating_sub(start), Ordering::SeqCst);
                    slot.exit_code.store(exit_code_of(status), Ordering::SeqCst);
                    slot.state.store(SlotState::Terminated as u8, Ordering::SeqCst);
                    if self.completion.finish_one() {
                        return Ok(reaped);
                    }
                }
            }
        }
    }
}

static REAP_TABLE: AtomicPtr<ReapTable> = AtomicPtr::new(ptr::null_mut());

extern "C" fn on_sigchld(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    let saved_errno = errno();
    let table = REAP_TABLE.load(Ordering::SeqCst);
    if !table.is_null() {
        // SAFETY: published tables are leaked and never freed.
        let table = unsafe { &*table };
        if let Err(e) = table.drain(&mut SysWaiter, &MonotonicClock) {
            signals::fatal(format_args!("benchprof: waitpid failed (errno {})", e));
        }
    }
    set_errno(saved_errno);
}

/// A snapshot of one benchmark process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: libc::pid_t,
    pub state: SlotState,
    /// When the paused child was claimed.
    pub launch_timestamp: u64,
    /// When it was resumed; elapsed counts from here.
    pub start_timestamp: u64,
    pub elapsed: Option<u64>,
    pub exit_code: Option<i32>,
    pub path: PathBuf,
    pub label: BenchmarkLabel,
}

#[derive(Debug)]
struct Launched {
    path: PathBuf,
    label: BenchmarkLabel,
    /// Read end of the CLOEXEC status pipe: EOF on exec, errno on failure.
    exec_status: Option<OwnedFd>,
}

/// Spawns, resumes and tracks benchmark processes.
pub struct ProcessController {
    table: &'static ReapTable,
    launched: Vec<Launched>,
    labeler: Box<dyn Labeler>,
    clock: MonotonicClock,
}

impl ProcessController {
    /// Allocate `capacity` slots and install the SIGCHLD reaper.
    ///
    /// The table lives until the process exits, the handler may reference it
    /// at any time.
    pub fn new(capacity: usize, labeler: Box<dyn Labeler>) -> Result<Self> {
        let table: &'static ReapTable = Box::leak(Box::new(ReapTable::with_capacity(capacity)));
        REAP_TABLE.store(table as *const ReapTable as *mut ReapTable, Ordering::SeqCst);
        signals::install_handler(libc::SIGCHLD, on_sigchld, libc::SA_NOCLDSTOP, &[])
            .context("Failed to install SIGCHLD handler")?;
        Ok(ProcessController {
            table,
            launched: Vec::with_capacity(capacity),
            labeler,
            clock: MonotonicClock,
        })
    }

    pub fn table(&self) -> &ReapTable {
        self.table
    }

    /// Fork `command_line` and leave the child stopped right before exec.
    ///
    /// Returns the slot index of the new benchmark.
    pub fn launch(&mut self, command_line: &str) -> Result<usize> {
        let argv: Vec<String> = command_line.split_whitespace().map(str::to_string).collect();
        if argv.is_empty() {
            bail!("Empty benchmark command");
        }

        let path = resolve_executable(&argv[0])
            .with_context(|| format!("Failed to resolve benchmark '{}'", argv[0]))?;
        let label = self.labeler.label(&argv);

        // Everything the child touches is allocated before fork.
        let path_cstr = CString::new(path.as_os_str().as_bytes())
            .with_context(|| "Command path contains null byte")?;
        let arg_cstrings = argv
            .iter()
            .map(|arg| {
                CString::new(arg.as_bytes())
                    .with_context(|| format!("Argument contains null byte: {}", arg))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut c_argv: Vec<*const libc::c_char> =
            arg_cstrings.iter().map(|s| s.as_ptr()).collect();
        c_argv.push(ptr::null());

        let mut exec_fds = [0i32; 2];
        if unsafe { libc::pipe2(exec_fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            bail!(
                "Failed to create exec pipe: {}",
                std::io::Error::last_os_error()
            );
        }
        // SAFETY: pipe2 just returned these descriptors.
        let exec_read = unsafe { OwnedFd::from_raw_fd(exec_fds[0]) };
        let exec_write = unsafe { OwnedFd::from_raw_fd(exec_fds[1]) };

        let parent_pid = unsafe { libc::getpid() };

        // Keep the reaper out until the slot is claimed.
        let _block = SignalBlock::new(&[libc::SIGCHLD]);

        let pid = unsafe { libc::fork() };
        match pid {
            -1 => bail!("fork() failed: {}", std::io::Error::last_os_error()),
            0 => unsafe {
                // Child: async-signal-safe calls only, never return.
                signals::unblock_all();
                libc::close(exec_read.as_raw_fd());
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
                if libc::getppid() != parent_pid {
                    libc::_exit(1);
                }

                // Park until the parent has the counters in place.
                libc::kill(libc::getpid(), libc::SIGSTOP);

                libc::execv(path_cstr.as_ptr(), c_argv.as_ptr());

                let errno_bytes = errno().to_ne_bytes();
                libc::write(
                    exec_write.as_raw_fd(),
                    errno_bytes.as_ptr() as *const libc::c_void,
                    errno_bytes.len(),
                );
                libc::_exit(127);
            },
            child_pid => {
                drop(exec_write);
                wait_until_stopped(child_pid)?;

                let slot = self.table.claim(child_pid, self.clock.now())?;
                tracing::info!(
                    "Launched {} (PID = {}), paused before exec",
                    command_line,
                    child_pid
                );

                // Slots are handed out in order and never recycled.
                debug_assert_eq!(slot, self.launched.len());
                self.launched.push(Launched {
                    path,
                    label,
                    exec_status: Some(exec_read),
                });
                Ok(slot)
            }
        }
    }

    /// Let a paused benchmark run.
    ///
    /// Whether its exec succeeded is only known once it has been reaped, see
    /// [`ProcessController::confirm_exec`].
    pub fn resume(&mut self, slot: usize) -> Result<()> {
        let pid = self.table.pid(slot);
        if !self.table.mark_running(slot, self.clock.now()) {
            bail!("Benchmark PID {} is not paused", pid);
        }
        if unsafe { libc::kill(pid, libc::SIGCONT) } != 0 {
            bail!(
                "Failed to resume PID {}: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
        tracing::debug!("Resumed PID {}", pid);
        Ok(())
    }

    /// Check the exec status of a reaped benchmark.
    ///
    /// Both ends of the status pipe are closed by then, so this never blocks.
    pub fn confirm_exec(&mut self, slot: usize) -> Result<()> {
        if self.table.state(slot) != SlotState::Terminated {
            bail!("Benchmark PID {} has not terminated", self.table.pid(slot));
        }
        let launched = &mut self.launched[slot];
        if let Some(fd) = launched.exec_status.take() {
            read_exec_status(&fd)
                .with_context(|| format!("Failed to exec {}", launched.path.display()))?;
        }
        Ok(())
    }

    /// Sleep until every launched benchmark has been reaped.
    pub fn wait_for_completion(&self) {
        let block = SignalBlock::new(&[libc::SIGCHLD]);
        while !self.table.completion().is_done() {
            block.suspend();
        }
    }

    pub fn record(&self, slot: usize) -> ProcessRecord {
        let outcome = self.table.outcome(slot);
        let launched = &self.launched[slot];
        ProcessRecord {
            pid: self.table.pid(slot),
            state: self.table.state(slot),
            launch_timestamp: self.table.launched_at(slot),
            start_timestamp: self.table.start(slot),
            elapsed: outcome.map(|(elapsed, _)| elapsed),
            exit_code: outcome.map(|(_, code)| code),
            path: launched.path.clone(),
            label: launched.label.clone(),
        }
    }
}

impl Drop for ProcessController {
    fn drop(&mut self) {
        for slot in 0..self.launched.len() {
            match self.table.state(slot) {
                SlotState::SpawnedPaused | SlotState::Running => unsafe {
                    let pid = self.table.pid(slot);
                    libc::kill(pid, libc::SIGKILL);
                    // The reaper may get there first, ECHILD is fine.
                    libc::waitpid(pid, ptr::null_mut(), 0);
                },
                _ => {}
            }
        }
    }
}

fn wait_until_stopped(pid: libc::pid_t) -> Result<()> {
    loop {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(pid, &mut status, libc::WUNTRACED) };
        if ret == -1 {
            if errno() == libc::EINTR {
                continue;
            }
            bail!(
                "Failed to wait for PID {} to pause: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
        if libc::WIFSTOPPED(status) {
            return Ok(());
        }
        bail!(
            "PID {} exited before it could be paused (code {})",
            pid,
            exit_code_of(status)
        );
    }
}

/// EOF means the exec went through, otherwise the child sent its errno.
fn read_exec_status(fd: &OwnedFd) -> Result<()> {
    let mut buf = [0u8; 4];
    let n = loop {
        let n = unsafe {
            libc::read(
                fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 && errno() == libc::EINTR {
            continue;
        }
        break n;
    };
    if n < 0 {
        bail!(
            "Failed to read exec status pipe: {}",
            std::io::Error::last_os_error()
        );
    }
    if n > 0 {
        let errno = if n >= 4 {
            i32::from_ne_bytes(buf)
        } else {
            buf[0] as i32
        };
        bail!("{}", std::io::Error::from_raw_os_error(errno));
    }
    Ok(())
}

/// Resolve a command name to its full path by searching PATH.
fn resolve_executable(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);

    if name.contains('/') {
        let metadata =
            std::fs::metadata(path).with_context(|| format!("Command not found: {}", name))?;
        if !metadata.is_file() {
            bail!("'{}' is not a regular file", name);
        }
        if metadata.permissions().mode() & 0o111 == 0 {
            bail!("'{}' is not executable", name);
        }
        return Ok(path.to_path_buf());
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':') {
            let candidate = Path::new(dir).join(name);
            if let Ok(metadata) = std::fs::metadata(&candidate) {
                if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
                    return Ok(candidate);
                }
            }
        }
    }

    bail!(
        "Command '{}' not found in PATH. Specify the full path to the executable.",
        name
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::VecDeque;

    struct ScriptedWaiter {
        events: VecDeque<WaitEvent>,
    }

    impl ScriptedWaiter {
        fn new(events: &[WaitEvent]) -> Self {
            ScriptedWaiter {
                events: events.iter().copied().collect(),
            }
        }

        /// Queue one signal delivery's worth of events.
        fn deliver(&mut self, events: &[WaitEvent]) {
            self.events.extend(events.iter().copied());
        }
    }

    impl ChildWaiter for ScriptedWaiter {
        fn wait_any(&mut self) -> WaitEvent {
            self.events.pop_front().unwrap_or(WaitEvent::Pending)
        }
    }

    struct StepClock(Cell<u64>);

    impl Clock for StepClock {
        fn now(&self) -> u64 {
            let now = self.0.get();
            self.0.set(now + 10);
            now
        }
    }

    fn exited(pid: libc::pid_t, code: i32) -> WaitEvent {
        WaitEvent::Exited {
            pid,
            status: (code & 0xff) << 8,
        }
    }

    #[test]
    fn test_exit_code_of() {
        assert_eq!(exit_code_of(0), 0);
        assert_eq!(exit_code_of(3 << 8), 3);
        assert_eq!(exit_code_of(libc::SIGKILL), 128 + libc::SIGKILL);
    }

    #[test]
    fn test_claim_and_run() {
        let table = ReapTable::with_capacity(2);
        let slot = table.claim(100, 5).unwrap();
        assert_eq!(table.state(slot), SlotState::SpawnedPaused);
        assert_eq!(table.completion().running(), 1);
        assert!(!table.completion().is_done());

        assert!(table.mark_running(slot, 50));
        assert!(!table.mark_running(slot, 60));
        assert_eq!(table.state(slot), SlotState::Running);
        assert_eq!(table.start(slot), 50);
        assert_eq!(table.launched_at(slot), 5);
        assert_eq!(table.outcome(slot), None);
    }

    fn status_pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn test_exec_status_eof_is_success() {
        let (read, write) = status_pipe();
        drop(write);
        assert!(read_exec_status(&read).is_ok());
    }

    #[test]
    fn test_exec_status_carries_errno() {
        let (read, write) = status_pipe();
        let bytes = libc::ENOEXEC.to_ne_bytes();
        let n = unsafe {
            libc::write(
                write.as_raw_fd(),
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
            )
        };
        assert_eq!(n, 4);
        drop(write);

        let err = read_exec_status(&read).unwrap_err();
        assert_eq!(
            err.to_string(),
            std::io::Error::from_raw_os_error(libc::ENOEXEC).to_string()
        );
    }

    #[test]
    fn test_claim_fails_when_full() {
        let table = ReapTable::with_capacity(1);
        table.claim(1, 0).unwrap();
        assert!(table.claim(2, 0).is_err());
    }

    #[test]
    fn test_two_exits_between_deliveries() {
        let table = ReapTable::with_capacity(2);
        let a = table.claim(101, 0).unwrap();
        let b = table.claim(102, 0).unwrap();
        table.mark_running(a, 100);
        table.mark_running(b, 200);

        // Both children exit before the first SIGCHLD is handled.
        let mut waiter = ScriptedWaiter::new(&[exited(101, 0), exited(102, 7), WaitEvent::Pending]);
        let clock = StepClock(Cell::new(1000));
        assert_eq!(table.drain(&mut waiter, &clock), Ok(2));

        assert_eq!(table.outcome(a), Some((900, 0)));
        assert_eq!(table.outcome(b), Some((810, 7)));
        assert_eq!(table.completion().running(), 0);
        assert!(table.completion().is_done());
        assert_eq!(table.completion().completions(), 1);

        // The second, coalesced delivery finds nothing left.
        assert_eq!(table.drain(&mut waiter, &clock), Ok(0));
        assert_eq!(table.completion().completions(), 1);
    }

    #[test]
    fn test_one_delivery_per_benchmark_when_not_coalesced() {
        let table = ReapTable::with_capacity(3);
        for pid in [1, 2, 3] {
            let slot = table.claim(pid, 0).unwrap();
            table.mark_running(slot, 0);
        }
        let clock = StepClock(Cell::new(1));
        let mut waiter = ScriptedWaiter::new(&[]);

        let mut deliveries = 0;
        for pid in [2, 3, 1] {
            waiter.deliver(&[exited(pid, 0), WaitEvent::Pending]);
            deliveries += 1;
            table.drain(&mut waiter, &clock).unwrap();
            if table.completion().is_done() {
                break;
            }
        }
        assert_eq!(deliveries, 3);
        assert_eq!(table.completion().completions(), 1);
    }

    #[test]
    fn test_no_children_ends_loop() {
        let table = ReapTable::with_capacity(1);
        table.claim(5, 0).unwrap();
        let mut waiter = ScriptedWaiter::new(&[WaitEvent::NoChildren, exited(5, 0)]);
        assert_eq!(table.drain(&mut waiter, &MonotonicClock), Ok(0));
        assert_eq!(table.completion().running(), 1);
    }

    #[test]
    fn test_wait_failure_is_reported() {
        let table = ReapTable::with_capacity(1);
        let mut waiter = ScriptedWaiter::new(&[WaitEvent::Failed(libc::EINVAL)]);
        assert_eq!(table.drain(&mut waiter, &MonotonicClock), Err(libc::EINVAL));
    }

    #[test]
    fn test_unknown_child_does_not_touch_running_count() {
        let table = ReapTable::with_capacity(1);
        table.claim(10, 0).unwrap();
        let mut waiter = ScriptedWaiter::new(&[exited(99, 0), WaitEvent::Pending]);
        assert_eq!(table.drain(&mut waiter, &MonotonicClock), Ok(1));
        assert_eq!(table.unknown_children(), 1);
        assert_eq!(table.completion().running(), 1);
        assert!(!table.completion().is_done());
    }

    #[test]
    fn test_double_reap_of_same_pid_counts_once() {
        let table = ReapTable::with_capacity(2);
        let a = table.claim(10, 0).unwrap();
        table.claim(11, 0).unwrap();
        table.mark_running(a, 0);
        let mut waiter = ScriptedWaiter::new(&[exited(10, 0), exited(10, 0), WaitEvent::Pending]);
        table.drain(&mut waiter, &MonotonicClock).unwrap();
        assert_eq!(table.completion().running(), 1);
        assert_eq!(table.unknown_children(), 1);
    }

    #[test]
    fn test_slots_are_reused_across_sequential_runs() {
        let table = ReapTable::with_capacity(2);
        let a = table.claim(1, 0).unwrap();
        let mut waiter = ScriptedWaiter::new(&[exited(1, 0)]);
        table.drain(&mut waiter, &MonotonicClock).unwrap();
        assert!(table.completion().is_done());

        let b = table.claim(2, 0).unwrap();
        assert_ne!(a, b);
        assert!(!table.completion().is_done());
        assert_eq!(table.outcome(a).map(|(_, code)| code), Some(0));
    }

    #[test]
    fn test_resolve_executable() {
        assert!(resolve_executable("sh").is_ok());
        assert!(resolve_executable("/definitely/not/here").is_err());
        assert!(resolve_executable("no-such-benchmark-binary").is_err());
        assert!(resolve_executable("/").is_err());
    }
}
