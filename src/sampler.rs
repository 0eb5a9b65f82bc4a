//! Periodic Sampler.
//!
//! A POSIX interval timer raises `SIGRTMIN` on every tick. The handler copies
//! the probe record and, once the target has left the probe's setup sentinel,
//! writes one row of counter deltas.
//!
//! The handler finds its [`SampleContext`] through a single published pointer.
//! [`Sampler::disarm`] stops the timer before withdrawing it, and the context
//! is only freed after that.

use std::io::Error;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::counters::{DeltaSource, MAX_COUNTERS};
use crate::probe::ProbeSource;
use crate::signals::{self, SignalBlock};
use crate::writer::{Sample, SampleWriter};

#[derive(Debug, Default)]
struct Counts {
    ticks: AtomicU64,
    rows: AtomicU64,
    invalid_reads: AtomicU64,
    write_errors: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub ticks: u64,
    pub rows: u64,
    pub invalid_reads: u64,
    pub write_errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The probe still shows the sentinel.
    NotStarted,
    Written { invalid: usize },
    WriteFailed,
}

/// Everything one benchmark's timer ticks need.
pub struct SampleContext<'a> {
    counters: &'a mut dyn DeltaSource,
    probe: &'a dyn ProbeSource,
    writer: &'a SampleWriter,
    benchmark: &'a str,
    input: &'a str,
    pid: libc::pid_t,
    started: AtomicBool,
    counts: Counts,
}

impl<'a> SampleContext<'a> {
    pub fn new(
        counters: &'a mut dyn DeltaSource,
        probe: &'a dyn ProbeSource,
        writer: &'a SampleWriter,
        benchmark: &'a str,
        input: &'a str,
        pid: libc::pid_t,
    ) -> Self {
        SampleContext {
            counters,
            probe,
            writer,
            benchmark,
            input,
            pid,
            started: AtomicBool::new(false),
            counts: Counts::default(),
        }
    }

    /// Whether the probe has reported anything but the sentinel yet.
    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TickStats {
        TickStats {
            ticks: self.counts.ticks.load(Ordering::SeqCst),
            rows: self.counts.rows.load(Ordering::SeqCst),
            invalid_reads: self.counts.invalid_reads.load(Ordering::SeqCst),
            write_errors: self.counts.write_errors.load(Ordering::SeqCst),
        }
    }

    /// One timer tick. Runs in signal context.
    pub fn tick(&self) -> TickOutcome {
        self.counts.ticks.fetch_add(1, Ordering::SeqCst);

        let record = self.probe.read();
        if !self.started.load(Ordering::SeqCst) {
            if record.is_sentinel() {
                return TickOutcome::NotStarted;
            }
            // The target never goes back to "not started".
            self.started.store(true, Ordering::SeqCst);
        }

        let mut deltas = [None; MAX_COUNTERS];
        let n = self.counters.len().min(MAX_COUNTERS);
        let invalid = self.counters.read_deltas(&mut deltas[..n]);
        if invalid > 0 {
            self.counts
                .invalid_reads
                .fetch_add(invalid as u64, Ordering::SeqCst);
            signals::write_stderr(format_args!(
                "benchprof: warning: {} invalid counter read(s) for PID {} in {}",
                invalid,
                self.pid,
                record.function()
            ));
        }

        let sample = Sample {
            benchmark: self.benchmark,
            input: self.input,
            pid: self.pid,
            function: record.function(),
            deltas: &deltas[..n],
        };
        match self.writer.write_sample(&sample) {
            Ok(()) => {
                self.counts.rows.fetch_add(1, Ordering::SeqCst);
                TickOutcome::Written { invalid }
            }
            Err(_) => {
                self.counts.write_errors.fetch_add(1, Ordering::SeqCst);
                TickOutcome::WriteFailed
            }
        }
    }
}

static ACTIVE: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

extern "C" fn on_timer(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    let saved_errno = unsafe { *libc::__errno_location() };
    let ctx = ACTIVE.load(Ordering::SeqCst);
    if !ctx.is_null() {
        // SAFETY: the pointer is only published while the owning Sampler
        // is alive, and withdrawn before the context is dropped.
        let ctx = unsafe { &*(ctx as *const SampleContext<'static>) };
        ctx.tick();
    }
    unsafe { *libc::__errno_location() = saved_errno };
}

/// The signal the sampling timer raises.
pub fn timer_signal() -> libc::c_int {
    libc::SIGRTMIN()
}

fn timespec(secs: i64, nanos: i64) -> libc::timespec {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    ts.tv_sec = secs as libc::time_t;
    ts.tv_nsec = nanos as _;
    ts
}

/// An armed sampling timer. Disarmed on drop.
pub struct Sampler<'a> {
    timer: Option<libc::timer_t>,
    published: bool,
    stopped: bool,
    ctx: Box<SampleContext<'a>>,
}

impl<'a> Sampler<'a> {
    /// Tick every `interval_s`.`interval_ns`, first after `first_s`.`first_ns`.
    ///
    /// A zero first delay fires first after one interval. Only one sampler
    /// can be armed at a time.
    pub fn arm(
        ctx: SampleContext<'a>,
        interval_s: i64,
        interval_ns: i64,
        first_s: i64,
        first_ns: i64,
    ) -> Result<Self> {
        if interval_s < 0 || !(0..1_000_000_000).contains(&interval_ns) {
            bail!("Invalid sampling interval {}s {}ns", interval_s, interval_ns);
        }
        if interval_s == 0 && interval_ns == 0 {
            bail!("Sampling interval must be greater than zero");
        }
        let (first_s, first_ns) = if first_s <= 0 && first_ns <= 0 {
            (interval_s, interval_ns)
        } else {
            (first_s.max(0), first_ns.clamp(0, 999_999_999))
        };

        let signo = timer_signal();
        signals::install_handler(signo, on_timer, 0, &[])
            .context("Failed to install sampling timer handler")?;

        let mut sampler = Sampler {
            timer: None,
            published: false,
            stopped: false,
            ctx: Box::new(ctx),
        };
        let raw = &*sampler.ctx as *const SampleContext<'a> as *mut ();
        if ACTIVE
            .compare_exchange(ptr::null_mut(), raw, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            bail!("Another sampler is already armed");
        }
        sampler.published = true;

        let mut sev: libc::sigevent = unsafe { mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_SIGNAL;
        sev.sigev_signo = signo;
        let mut timer: libc::timer_t = ptr::null_mut();
        if unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut timer) } != 0 {
            bail!("Failed to create sampling timer: {}", Error::last_os_error());
        }
        sampler.timer = Some(timer);

        let spec = libc::itimerspec {
            it_interval: timespec(interval_s, interval_ns),
            it_value: timespec(first_s, first_ns),
        };
        if unsafe { libc::timer_settime(timer, 0, &spec, ptr::null_mut()) } != 0 {
            bail!("Failed to start sampling timer: {}", Error::last_os_error());
        }
        tracing::debug!(
            "Sampling every {}s {}ns on signal {}",
            interval_s,
            interval_ns,
            signo
        );
        Ok(sampler)
    }

    /// [`Sampler::arm`] with the same period for the first and every later tick.
    pub fn arm_every(ctx: SampleContext<'a>, period: Duration) -> Result<Self> {
        let secs = period.as_secs() as i64;
        let nanos = period.subsec_nanos() as i64;
        Self::arm(ctx, secs, nanos, secs, nanos)
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    pub fn context(&self) -> &SampleContext<'a> {
        &self.ctx
    }

    /// Stop the timer, withdraw the context from the handler and stop the
    /// counters. Safe to call repeatedly.
    pub fn disarm(&mut self) -> Result<()> {
        if let Some(timer) = self.timer.take() {
            let zero = libc::itimerspec {
                it_interval: timespec(0, 0),
                it_value: timespec(0, 0),
            };
            unsafe {
                libc::timer_settime(timer, 0, &zero, ptr::null_mut());
                libc::timer_delete(timer);
            }
        }

        if self.published {
            // Ticks already queued stay pending until the pointer is gone.
            let _block = SignalBlock::new(&[timer_signal()]);
            ACTIVE.store(ptr::null_mut(), Ordering::SeqCst);
            self.published = false;
        }

        if !self.stopped {
            self.stopped = true;
            self.ctx.counters.stop()?;
        }
        Ok(())
    }
}

impl Drop for Sampler<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.disarm() {
            tracing::warn!("Failed to disarm sampler: {:#}", e);
        }
    }
}
