//! Sample Writer.
//!
//! Rows are formatted into a stack buffer and handed to the kernel with one
//! unbuffered `write(2)` on an `O_APPEND` descriptor, so the sampler can call
//! this from its signal handler.

use std::fmt::{self, Write as _};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};

use crate::signals::FixedBuf;

/// Room for the header plus one row.
const ROW_BUF_SIZE: usize = 4096;

const FIXED_COLUMNS: [&str; 4] = ["benchmark", "input", "pid", "function"];

/// One row of output. Borrowed, never stored.
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    pub benchmark: &'a str,
    pub input: &'a str,
    pub pid: libc::pid_t,
    pub function: &'a str,
    /// One entry per configured counter; `None` is written as an empty field.
    pub deltas: &'a [Option<u64>],
}

#[derive(Debug)]
pub struct SampleWriter {
    file: File,
    labels: Vec<String>,
    header_pending: AtomicBool,
}

impl SampleWriter {
    /// Create `path` or append to it. The header is only written into an
    /// empty file; a non-empty file must already carry the same header.
    pub fn open(path: &Path, labels: Vec<String>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .mode(0o660)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .with_context(|| format!("Cannot open output file {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("Cannot stat output file {}", path.display()))?
            .len();
        let writer = Self::from_file(file, labels, len == 0);
        if len == 0 {
            tracing::info!("Output file {} is new, writing header", path.display());
        } else {
            writer
                .check_header()
                .with_context(|| format!("Cannot append to {}", path.display()))?;
        }
        Ok(writer)
    }

    /// Compare the file's first line with the header these labels produce.
    fn check_header(&self) -> Result<()> {
        let mut existing = String::new();
        BufReader::new(&self.file).read_line(&mut existing)?;
        let existing = existing.trim_end_matches(['\n', '\r']);

        let mut buf = FixedBuf::<ROW_BUF_SIZE>::new();
        if format_header(&mut buf, &self.labels).is_err() {
            bail!("Header for {} counters does not fit a row", self.labels.len());
        }
        let expected = std::str::from_utf8(buf.as_bytes())?.trim_end_matches('\n');
        if existing != expected {
            bail!(
                "Existing header {:?} does not match the selected counters {:?}",
                existing,
                expected
            );
        }
        Ok(())
    }

    pub fn from_file(file: File, labels: Vec<String>, header_pending: bool) -> Self {
        SampleWriter {
            file,
            labels,
            header_pending: AtomicBool::new(header_pending),
        }
    }

    pub fn header_pending(&self) -> bool {
        self.header_pending.load(Ordering::SeqCst)
    }

    /// Write one row, preceded by the column header when `emit_header` is set.
    pub fn write_row(&self, sample: &Sample<'_>, emit_header: bool) -> io::Result<()> {
        let mut buf = FixedBuf::<ROW_BUF_SIZE>::new();
        self.format_row(&mut buf, sample, emit_header)
            .map_err(|_| io::Error::from_raw_os_error(libc::ENOBUFS))?;
        (&self.file).write_all(buf.as_bytes())
    }

    /// Write one row, with the header if this is the first row of the file.
    pub fn write_sample(&self, sample: &Sample<'_>) -> io::Result<()> {
        let emit_header = self.header_pending.load(Ordering::SeqCst);
        self.write_row(sample, emit_header)?;
        if emit_header {
            self.header_pending.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn format_row<const N: usize>(
        &self,
        buf: &mut FixedBuf<N>,
        sample: &Sample<'_>,
        emit_header: bool,
    ) -> fmt::Result {
        if emit_header {
            format_header(buf, &self.labels)?;
        }

        write_field(buf, sample.benchmark)?;
        buf.write_char(',')?;
        write_field(buf, sample.input)?;
        write!(buf, ",{},", sample.pid)?;
        write_field(buf, sample.function)?;
        for delta in sample.deltas {
            match delta {
                Some(value) => write!(buf, ",{}", value)?,
                None => buf.write_char(',')?,
            }
        }
        buf.write_char('\n')
    }
}

fn format_header<const N: usize>(buf: &mut FixedBuf<N>, labels: &[String]) -> fmt::Result {
    for (i, column) in FIXED_COLUMNS.iter().enumerate() {
        if i > 0 {
            buf.write_char(',')?;
        }
        buf.write_str(column)?;
    }
    for label in labels {
        buf.write_char(',')?;
        write_field(buf, label)?;
    }
    buf.write_char('\n')
}

/// RFC 4180 quoting for fields holding a separator, quote or line break.
fn write_field<const N: usize>(buf: &mut FixedBuf<N>, field: &str) -> fmt::Result {
    if !field.contains([',', '"', '\n', '\r']) {
        return buf.write_str(field);
    }
    buf.write_char('"')?;
    for (i, part) in field.split('"').enumerate() {
        if i > 0 {
            buf.write_str("\"\"")?;
        }
        buf.write_str(part)?;
    }
    buf.write_char('"')
}
