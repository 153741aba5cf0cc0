//! Optional period logger: records (start, end) timestamps of every RT cycle
//! into a binary file without ever blocking the RT thread.
//!
//! Two banks share one flat buffer; the RT side writes into one bank while
//! the writer thread flushes the other. Saturation raises an overrun flag
//! which is materialized in the file as a (0, 0) sentinel pair.

use std::cell::UnsafeCell;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{ErrorKind, RaspaError};

const BANK_SIZE_BITS: usize = 13;
const BANK_SIZE: usize = 1 << BANK_SIZE_BITS;

const WRITER_SLEEP: Duration = Duration::from_millis(500);

/// Default log file when the debug flag enables the logger.
pub const RUN_LOG_DEFAULT_PATH: &str = "/tmp/raspa_run.log";

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
struct RunLogItem {
    start_us: i64,
    end_us: i64,
}

struct Banks {
    items: Box<[UnsafeCell<RunLogItem>]>,
    write_count: AtomicUsize,
    read_count: AtomicUsize,
    overrun: AtomicBool,
    running: AtomicBool,
}

unsafe impl Sync for Banks {}

impl Banks {
    fn new() -> Self {
        let mut items = Vec::with_capacity(2 * BANK_SIZE);
        for _ in 0..2 * BANK_SIZE {
            items.push(UnsafeCell::new(RunLogItem::default()));
        }
        Self {
            items: items.into_boxed_slice(),
            write_count: AtomicUsize::new(0),
            read_count: AtomicUsize::new(0),
            overrun: AtomicBool::new(false),
            running: AtomicBool::new(true),
        }
    }

    #[inline]
    fn slot(count: usize) -> usize {
        let bank = (count >> BANK_SIZE_BITS) & 0x1;
        let offset = count & (BANK_SIZE - 1);
        bank * BANK_SIZE + offset
    }
}

/// RT-side handle; `put` is wait-free.
#[derive(Clone)]
pub struct RunLogHandle {
    banks: Arc<Banks>,
}

impl RunLogHandle {
    /// Record one period. Saturation sets the overrun flag instead of
    /// blocking or overwriting unread data.
    #[inline]
    pub fn put(&self, start_us: i64, end_us: i64) {
        let banks = &*self.banks;
        if !banks.running.load(Ordering::Acquire) {
            return;
        }

        let write = banks.write_count.load(Ordering::Relaxed);
        let read = banks.read_count.load(Ordering::Acquire);
        if write.wrapping_sub(read) < 2 * BANK_SIZE - 1 {
            unsafe {
                *banks.items[Banks::slot(write)].get() = RunLogItem { start_us, end_us };
            }
            banks.write_count.store(write.wrapping_add(1), Ordering::Release);
        } else {
            banks.overrun.store(true, Ordering::Release);
        }
    }
}

pub struct RunLogger {
    banks: Arc<Banks>,
    writer: Option<JoinHandle<File>>,
}

impl RunLogger {
    /// Open the log file for binary writing and start the writer thread.
    pub fn start(path: &Path) -> Result<Self, RaspaError> {
        let file =
            File::create(path).map_err(|e| RaspaError::from_os(ErrorKind::RunLogFileOpen, &e))?;

        let banks = Arc::new(Banks::new());
        let writer = {
            let banks = Arc::clone(&banks);
            std::thread::Builder::new()
                .name("raspa-run-log".into())
                .spawn(move || writer_loop(banks, file))
                .map_err(|e| RaspaError::from_os(ErrorKind::RunLogFileOpen, &e))?
        };

        Ok(Self {
            banks,
            writer: Some(writer),
        })
    }

    pub fn handle(&self) -> RunLogHandle {
        RunLogHandle {
            banks: Arc::clone(&self.banks),
        }
    }

    /// Flush any residual bank, join the writer and close the file.
    pub fn terminate(&mut self) -> Result<(), RaspaError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        self.banks.running.store(false, Ordering::Release);
        let file = writer
            .join()
            .map_err(|_| RaspaError::new(ErrorKind::RunLogFileClose))?;
        file.sync_all()
            .map_err(|e| RaspaError::from_os(ErrorKind::RunLogFileClose, &e))
    }
}

impl Drop for RunLogger {
    fn drop(&mut self) {
        let _ = self.terminate();
    }
}

fn writer_loop(banks: Arc<Banks>, mut file: File) -> File {
    while banks.running.load(Ordering::Acquire) {
        std::thread::sleep(WRITER_SLEEP);
        flush(&banks, &mut file, false);
    }
    // residual entries after the stop signal; a drain pass moves at most one
    // bank, so repeat until the counters meet
    loop {
        flush(&banks, &mut file, true);
        let write = banks.write_count.load(Ordering::Acquire);
        let read = banks.read_count.load(Ordering::Relaxed);
        if write == read {
            break;
        }
    }
    file
}

/// Write out at most one full bank. With `drain` set, any count flushes;
/// otherwise only complete banks do, so the RT side keeps a bank to itself.
fn flush(banks: &Banks, file: &mut File, drain: bool) {
    let write = banks.write_count.load(Ordering::Acquire);
    let read = banks.read_count.load(Ordering::Relaxed);
    let mut count = write.wrapping_sub(read);

    let threshold = if drain { 1 } else { BANK_SIZE };
    if count < threshold {
        return;
    }
    if count > BANK_SIZE {
        count = BANK_SIZE;
    }

    let first = Banks::slot(read);
    if banks.overrun.swap(false, Ordering::AcqRel) {
        // overrun is stored as a pair of zero timestamps
        unsafe {
            *banks.items[first].get() = RunLogItem::default();
        }
    }

    let bytes = unsafe {
        std::slice::from_raw_parts(
            banks.items[first].get() as *const u8,
            count * std::mem::size_of::<RunLogItem>(),
        )
    };
    if let Err(err) = file.write_all(bytes) {
        tracing::error!(?err, "run logger file write failed");
    }
    banks.read_count.store(read.wrapping_add(count), Ordering::Release);
}
