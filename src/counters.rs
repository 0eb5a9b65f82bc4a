//! Counter Set Manager.
//!
//! A [`CounterSet`] owns one open counter per [`CounterDescriptor`], all bound
//! to the same target process (and optionally core). Counts are reported as
//! deltas from the baseline captured by [`CounterSet::start`].

use std::fmt;
use std::io;

use anyhow::{bail, Context, Result};

use crate::perf::{
    perf_event_attr, perf_event_open, PerfEventFile, PERF_FLAG_FD_CLOEXEC, PERF_TYPE_HARDWARE,
    PERF_TYPE_RAW, PERF_TYPE_SOFTWARE,
};

/// Upper bound on counters in one set. Beyond this the PMU starts
/// multiplexing general-purpose counters and deltas stop being comparable.
pub const MAX_COUNTERS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Hardware,
    Software,
    Raw,
}

impl CounterKind {
    fn perf_type(self) -> u32 {
        match self {
            CounterKind::Hardware => PERF_TYPE_HARDWARE,
            CounterKind::Software => PERF_TYPE_SOFTWARE,
            CounterKind::Raw => PERF_TYPE_RAW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterDescriptor {
    pub kind: CounterKind,
    pub code: u64,
    pub label: String,
}

const GENERIC_EVENTS: &[(&str, &str, CounterKind, u64)] = &[
    ("PERF_COUNT_HW_CPU_CYCLES", "cycles", CounterKind::Hardware, 0),
    ("PERF_COUNT_HW_INSTRUCTIONS", "instructions", CounterKind::Hardware, 1),
    ("PERF_COUNT_HW_CACHE_REFERENCES", "cache-references", CounterKind::Hardware, 2),
    ("PERF_COUNT_HW_CACHE_MISSES", "cache-misses", CounterKind::Hardware, 3),
    ("PERF_COUNT_HW_BRANCH_INSTRUCTIONS", "branches", CounterKind::Hardware, 4),
    ("PERF_COUNT_HW_BRANCH_MISSES", "branch-misses", CounterKind::Hardware, 5),
    ("PERF_COUNT_HW_BUS_CYCLES", "bus-cycles", CounterKind::Hardware, 6),
    ("PERF_COUNT_HW_STALLED_CYCLES_FRONTEND", "stalled-cycles-frontend", CounterKind::Hardware, 7),
    ("PERF_COUNT_HW_STALLED_CYCLES_BACKEND", "stalled-cycles-backend", CounterKind::Hardware, 8),
    ("PERF_COUNT_HW_REF_CPU_CYCLES", "ref-cycles", CounterKind::Hardware, 9),
    ("PERF_COUNT_SW_CPU_CLOCK", "cpu-clock", CounterKind::Software, 0),
    ("PERF_COUNT_SW_TASK_CLOCK", "task-clock", CounterKind::Software, 1),
    ("PERF_COUNT_SW_PAGE_FAULTS", "page-faults", CounterKind::Software, 2),
    ("PERF_COUNT_SW_CONTEXT_SWITCHES", "context-switches", CounterKind::Software, 3),
    ("PERF_COUNT_SW_CPU_MIGRATIONS", "cpu-migrations", CounterKind::Software, 4),
    ("PERF_COUNT_SW_PAGE_FAULTS_MIN", "minor-faults", CounterKind::Software, 5),
    ("PERF_COUNT_SW_PAGE_FAULTS_MAJ", "major-faults", CounterKind::Software, 6),
    ("PERF_COUNT_SW_ALIGNMENT_FAULTS", "alignment-faults", CounterKind::Software, 7),
    ("PERF_COUNT_SW_EMULATION_FAULTS", "emulation-faults", CounterKind::Software, 8),
];

/// Counters tracked when none are requested.
pub const DEFAULT_EVENTS: [&str; 4] = [
    "PERF_COUNT_HW_CACHE_MISSES",
    "PERF_COUNT_HW_INSTRUCTIONS",
    "PERF_COUNT_HW_BRANCH_MISSES",
    "PERF_COUNT_SW_PAGE_FAULTS",
];

impl CounterDescriptor {
    /// Resolve a generic perf event name (`PERF_COUNT_HW_INSTRUCTIONS`), its
    /// perf-tool alias (`instructions`) or a raw PMU code (`r1c4`).
    pub fn from_name(name: &str) -> Result<Self> {
        for (full, alias, kind, code) in GENERIC_EVENTS {
            if name == *full || name.eq_ignore_ascii_case(alias) {
                return Ok(CounterDescriptor {
                    kind: *kind,
                    code: *code,
                    label: name.to_string(),
                });
            }
        }

        if let Some(hex) = name.strip_prefix('r') {
            if !hex.is_empty() {
                if let Ok(code) = u64::from_str_radix(hex, 16) {
                    return Ok(CounterDescriptor {
                        kind: CounterKind::Raw,
                        code,
                        label: name.to_string(),
                    });
                }
            }
        }

        bail!("Unknown perf event '{}'", name);
    }

    /// Resolve a whitespace separated event list, keeping at most `count`
    /// entries when a count is given.
    pub fn parse_list(list: &str, count: Option<usize>) -> Result<Vec<Self>> {
        let names = list.split_whitespace();
        let descriptors = match count {
            Some(n) => names.take(n).map(Self::from_name).collect::<Result<Vec<_>>>()?,
            None => names.map(Self::from_name).collect::<Result<Vec<_>>>()?,
        };
        if let Some(n) = count {
            if descriptors.len() < n {
                bail!(
                    "Asked for {} perf events but only {} were listed",
                    n,
                    descriptors.len()
                );
            }
        }
        Ok(descriptors)
    }

    pub fn defaults() -> Vec<Self> {
        DEFAULT_EVENTS
            .iter()
            .map(|name| Self::from_name(name).expect("default events are known"))
            .collect()
    }
}

impl fmt::Display for CounterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?} {:#x})", self.label, self.kind, self.code)
    }
}

/// The operations a [`CounterSet`] needs from one open counter.
///
/// `read` is called from the sampler's signal handler and must not allocate.
pub trait CounterHandle {
    fn reset(&mut self) -> io::Result<()>;
    fn enable(&mut self) -> io::Result<()>;
    fn disable(&mut self) -> io::Result<()>;
    fn read(&self) -> io::Result<u64>;
}

impl CounterHandle for PerfEventFile {
    fn reset(&mut self) -> io::Result<()> {
        PerfEventFile::reset(self)
    }

    fn enable(&mut self) -> io::Result<()> {
        PerfEventFile::enable(self)
    }

    fn disable(&mut self) -> io::Result<()> {
        PerfEventFile::disable(self)
    }

    fn read(&self) -> io::Result<u64> {
        self.read_value()
    }
}

/// Counters as the sampler sees them.
pub trait DeltaSource {
    fn len(&self) -> usize;

    /// Fill `out` with one delta per counter, `None` where the read was
    /// invalid. Returns how many counters were invalid.
    fn read_deltas(&self, out: &mut [Option<u64>]) -> usize;

    /// Stop counting, keeping the counters open.
    fn stop(&mut self) -> Result<()>;
}

pub struct CounterSet<H: CounterHandle = PerfEventFile> {
    descriptors: Vec<CounterDescriptor>,
    handles: Vec<H>,
    baseline: Vec<u64>,
    running: bool,
}

impl CounterSet<PerfEventFile> {
    /// Open one user-space-only counter per descriptor on `pid`.
    ///
    /// `core` restricts counting to that CPU, `None` counts on any CPU. Every
    /// counter must open: a partial set is closed and the error returned.
    pub fn configure(
        pid: libc::pid_t,
        core: Option<u32>,
        descriptors: &[CounterDescriptor],
    ) -> Result<Self> {
        check_descriptors(descriptors)?;
        let cpu = core.map(|c| c as libc::c_int).unwrap_or(-1);

        let mut handles = Vec::with_capacity(descriptors.len());
        for desc in descriptors {
            let attr = perf_event_attr::counting(desc.kind.perf_type(), desc.code);
            let file = perf_event_open(&attr, pid, cpu, -1, PERF_FLAG_FD_CLOEXEC)
                .with_context(|| {
                    format!(
                        "Failed to open perf event {} for pid {} on cpu {}",
                        desc, pid, cpu
                    )
                })?;
            handles.push(file);
        }
        tracing::debug!("Opened {} perf counters for pid {}", handles.len(), pid);
        Self::from_handles(descriptors.to_vec(), handles)
    }
}

fn check_descriptors(descriptors: &[CounterDescriptor]) -> Result<()> {
    if descriptors.is_empty() {
        bail!("No perf events configured");
    }
    if descriptors.len() > MAX_COUNTERS {
        bail!(
            "{} perf events requested, at most {} can be counted at once",
            descriptors.len(),
            MAX_COUNTERS
        );
    }
    Ok(())
}

impl<H: CounterHandle> CounterSet<H> {
    /// Build a set from already opened handles, one per descriptor.
    pub fn from_handles(descriptors: Vec<CounterDescriptor>, handles: Vec<H>) -> Result<Self> {
        check_descriptors(&descriptors)?;
        if descriptors.len() != handles.len() {
            bail!(
                "{} counter handles for {} descriptors",
                handles.len(),
                descriptors.len()
            );
        }
        let baseline = vec![0; handles.len()];
        Ok(CounterSet {
            descriptors,
            handles,
            baseline,
            running: false,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Reset and enable every counter, then take the baseline.
    pub fn start(&mut self) -> Result<()> {
        for (desc, handle) in self.descriptors.iter().zip(self.handles.iter_mut()) {
            handle
                .reset()
                .with_context(|| format!("Failed to reset {}", desc.label))?;
            handle
                .enable()
                .with_context(|| format!("Failed to enable {}", desc.label))?;
        }
        self.running = true;
        for (i, handle) in self.handles.iter().enumerate() {
            self.baseline[i] = handle
                .read()
                .with_context(|| format!("Failed to read baseline of {}", self.descriptors[i].label))?;
        }
        Ok(())
    }

    /// Disable every counter without closing it. Safe to call repeatedly.
    pub fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        for (desc, handle) in self.descriptors.iter().zip(self.handles.iter_mut()) {
            handle
                .disable()
                .with_context(|| format!("Failed to disable {}", desc.label))?;
        }
        Ok(())
    }

    /// Release every counter. The set is empty afterwards.
    pub fn close(&mut self) {
        if self.running {
            let _ = self.stop();
        }
        self.handles.clear();
        self.baseline.clear();
    }
}

impl<H: CounterHandle> DeltaSource for CounterSet<H> {
    fn len(&self) -> usize {
        self.handles.len()
    }

    fn read_deltas(&self, out: &mut [Option<u64>]) -> usize {
        let mut invalid = 0;
        for (i, slot) in out.iter_mut().enumerate() {
            let (Some(handle), Some(base)) = (self.handles.get(i), self.baseline.get(i)) else {
                *slot = None;
                continue;
            };
            *slot = match handle.read() {
                Ok(raw) if raw >= *base => Some(raw - base),
                _ => None,
            };
            if slot.is_none() {
                invalid += 1;
            }
        }
        invalid
    }

    fn stop(&mut self) -> Result<()> {
        CounterSet::stop(self)
    }
}

impl<H: CounterHandle> Drop for CounterSet<H> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// A counter whose raw value is scripted by the test.
    pub(crate) struct FakeHandle {
        pub value: Rc<Cell<u64>>,
        pub enabled: Rc<Cell<bool>>,
        pub fail_reads: Rc<Cell<bool>>,
    }

    impl FakeHandle {
        pub(crate) fn new(start: u64) -> Self {
            FakeHandle {
                value: Rc::new(Cell::new(start)),
                enabled: Rc::new(Cell::new(false)),
                fail_reads: Rc::new(Cell::new(false)),
            }
        }
    }

    impl CounterHandle for FakeHandle {
        fn reset(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn enable(&mut self) -> io::Result<()> {
            self.enabled.set(true);
            Ok(())
        }

        fn disable(&mut self) -> io::Result<()> {
            self.enabled.set(false);
            Ok(())
        }

        fn read(&self) -> io::Result<u64> {
            if self.fail_reads.get() {
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
            Ok(self.value.get())
        }
    }

    fn descriptors(n: usize) -> Vec<CounterDescriptor> {
        DEFAULT_EVENTS
            .iter()
            .chain(["PERF_COUNT_HW_CPU_CYCLES"].iter())
            .take(n)
            .map(|name| CounterDescriptor::from_name(name).unwrap())
            .collect()
    }

    #[test]
    fn test_resolve_generic_names_and_aliases() {
        let desc = CounterDescriptor::from_name("PERF_COUNT_HW_INSTRUCTIONS").unwrap();
        assert_eq!(desc.kind, CounterKind::Hardware);
        assert_eq!(desc.code, 1);
        assert_eq!(desc.label, "PERF_COUNT_HW_INSTRUCTIONS");

        let desc = CounterDescriptor::from_name("page-faults").unwrap();
        assert_eq!(desc.kind, CounterKind::Software);
        assert_eq!(desc.code, 2);

        let desc = CounterDescriptor::from_name("r1c4").unwrap();
        assert_eq!(desc.kind, CounterKind::Raw);
        assert_eq!(desc.code, 0x1c4);

        assert!(CounterDescriptor::from_name("bogus").is_err());
        assert!(CounterDescriptor::from_name("r").is_err());
    }

    #[test]
    fn test_parse_list_with_count() {
        let list = "instructions cache-misses page-faults";
        assert_eq!(CounterDescriptor::parse_list(list, None).unwrap().len(), 3);
        let two = CounterDescriptor::parse_list(list, Some(2)).unwrap();
        assert_eq!(two.len(), 2);
        assert_eq!(two[1].label, "cache-misses");
        assert!(CounterDescriptor::parse_list(list, Some(4)).is_err());
    }

    #[test]
    fn test_defaults() {
        let defaults = CounterDescriptor::defaults();
        assert_eq!(defaults.len(), 4);
        assert_eq!(defaults[3].kind, CounterKind::Software);
    }

    #[test]
    fn test_rejects_empty_and_oversized_sets() {
        assert!(CounterSet::<FakeHandle>::from_handles(vec![], vec![]).is_err());

        let handles = (0..6).map(|_| FakeHandle::new(0)).collect();
        let mut descs = descriptors(5);
        descs.push(descs[0].clone());
        assert!(CounterSet::from_handles(descs, handles).is_err());

        let handles = vec![FakeHandle::new(0)];
        assert!(CounterSet::from_handles(descriptors(2), handles).is_err());
    }

    #[test]
    fn test_deltas_are_zero_right_after_start() {
        let handles: Vec<_> = [100, 2000, 7].iter().map(|v| FakeHandle::new(*v)).collect();
        let mut set = CounterSet::from_handles(descriptors(3), handles).unwrap();
        set.start().unwrap();

        let mut out = [None; MAX_COUNTERS];
        let invalid = set.read_deltas(&mut out[..set.len()]);
        assert_eq!(invalid, 0);
        assert_eq!(&out[..3], &[Some(0), Some(0), Some(0)]);
    }

    #[test]
    fn test_deltas_relative_to_baseline() {
        let handle = FakeHandle::new(500);
        let value = handle.value.clone();
        let mut set = CounterSet::from_handles(descriptors(1), vec![handle]).unwrap();
        set.start().unwrap();

        value.set(742);
        let mut out = [None; 1];
        assert_eq!(set.read_deltas(&mut out), 0);
        assert_eq!(out[0], Some(242));
    }

    #[test]
    fn test_regressed_counter_is_flagged_not_fatal() {
        let a = FakeHandle::new(10);
        let b = FakeHandle::new(10);
        let a_value = a.value.clone();
        let b_value = b.value.clone();
        let mut set = CounterSet::from_handles(descriptors(2), vec![a, b]).unwrap();
        set.start().unwrap();

        a_value.set(5);
        b_value.set(15);
        let mut out = [None; 2];
        assert_eq!(set.read_deltas(&mut out), 1);
        assert_eq!(out, [None, Some(5)]);
    }

    #[test]
    fn test_failed_read_is_flagged() {
        let handle = FakeHandle::new(1);
        let fail = handle.fail_reads.clone();
        let mut set = CounterSet::from_handles(descriptors(1), vec![handle]).unwrap();
        set.start().unwrap();

        fail.set(true);
        let mut out = [Some(3); 1];
        assert_eq!(set.read_deltas(&mut out), 1);
        assert_eq!(out[0], None);
    }

    #[test]
    fn test_stop_and_close_are_idempotent() {
        let handle = FakeHandle::new(0);
        let enabled = handle.enabled.clone();
        let mut set = CounterSet::from_handles(descriptors(1), vec![handle]).unwrap();

        set.stop().unwrap();
        set.start().unwrap();
        assert!(enabled.get());
        assert!(set.is_running());

        set.stop().unwrap();
        set.stop().unwrap();
        assert!(!enabled.get());
        assert!(!set.is_running());

        set.close();
        set.close();
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_restart_takes_new_baseline() {
        let handle = FakeHandle::new(10);
        let value = handle.value.clone();
        let mut set = CounterSet::from_handles(descriptors(1), vec![handle]).unwrap();
        set.start().unwrap();
        value.set(50);
        set.stop().unwrap();

        set.start().unwrap();
        let mut out = [None; 1];
        set.read_deltas(&mut out);
        assert_eq!(out[0], Some(0));
    }

    #[test]
    #[ignore] // Requires perf_event_paranoid <= 2
    fn test_configure_on_self() {
        let descs = vec![CounterDescriptor::from_name("task-clock").unwrap()];
        let mut set = CounterSet::configure(0, None, &descs).expect("configure");
        set.start().unwrap();
        let mut out = [None; 1];
        assert_eq!(set.read_deltas(&mut out), 0);
        set.stop().unwrap();
        set.close();
    }
}
