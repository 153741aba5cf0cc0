//! Shared fixtures: a scripted driver transport and a temp-dir parameter
//! surface, so engine scenarios run without a kernel module.
#![allow(dead_code)]

use std::cell::UnsafeCell;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;

use raspa::config::DriverConfig;
use raspa::driver::{DriverTransport, SharedRegion};
use raspa::engine::RaspaEngine;
use raspa::gpio::GpioSocketPaths;
use raspa::packet::{AudioCtrlPkt, PKT_SIZE_WORDS};

/// Plenty for 20 pages of any common page size.
pub const MOCK_REGION_WORDS: usize = 64 * 1024;

type PeriodHook = Box<dyn FnMut(&MockDriver, u64, usize) + Send>;

/// Deterministic driver double: serves `max_periods` buffer indices in
/// ping-pong order, then fails `irq_wait` like a stopped driver would. A
/// per-period hook lets tests inject rx data exactly when the hardware
/// would.
pub struct MockDriver {
    mem: Box<[UnsafeCell<i32>]>,
    max_periods: u64,
    pace: Duration,
    period: AtomicU64,
    stopped: AtomicBool,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    corrections: Mutex<Vec<i32>>,
    hook: Mutex<Option<PeriodHook>>,
}

unsafe impl Sync for MockDriver {}

impl MockDriver {
    pub fn new(max_periods: u64) -> Arc<Self> {
        Self::with_pace(max_periods, Duration::ZERO)
    }

    /// `pace` simulates the period duration; irq_wait sleeps that long.
    pub fn with_pace(max_periods: u64, pace: Duration) -> Arc<Self> {
        let mut mem = Vec::with_capacity(MOCK_REGION_WORDS);
        for _ in 0..MOCK_REGION_WORDS {
            mem.push(UnsafeCell::new(0));
        }
        Arc::new(Self {
            mem: mem.into_boxed_slice(),
            max_periods,
            pace,
            period: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            corrections: Mutex::new(Vec::new()),
            hook: Mutex::new(None),
        })
    }

    pub fn set_period_hook(&self, hook: impl FnMut(&MockDriver, u64, usize) + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn read_word(&self, index: usize) -> i32 {
        unsafe { *self.mem[index].get() }
    }

    pub fn write_word(&self, index: usize, value: i32) {
        unsafe { *self.mem[index].get() = value };
    }

    pub fn read_pkt(&self, word_offset: usize) -> AudioCtrlPkt {
        unsafe { (self.mem[word_offset].get() as *const AudioCtrlPkt).read() }
    }

    pub fn write_pkt(&self, word_offset: usize, pkt: &AudioCtrlPkt) {
        assert!(word_offset + PKT_SIZE_WORDS <= MOCK_REGION_WORDS);
        unsafe { (self.mem[word_offset].get() as *mut AudioCtrlPkt).write(*pkt) };
    }

    pub fn periods_served(&self) -> u64 {
        self.period.load(Ordering::SeqCst).min(self.max_periods)
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn corrections(&self) -> Vec<i32> {
        self.corrections.lock().unwrap().clone()
    }
}

impl DriverTransport for MockDriver {
    fn irq_wait(&self) -> Result<usize, Errno> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Errno::EBADF);
        }
        let n = self.period.fetch_add(1, Ordering::SeqCst);
        if n >= self.max_periods {
            return Err(Errno::EBADF);
        }
        if !self.pace.is_zero() {
            std::thread::sleep(self.pace);
        }
        let idx = (n & 1) as usize;
        if let Some(hook) = self.hook.lock().unwrap().as_mut() {
            hook(self, n, idx);
        }
        Ok(idx)
    }

    fn userproc_finished(&self, correction_ns: Option<i32>) -> Result<(), Errno> {
        if let Some(correction) = correction_ns {
            self.corrections.lock().unwrap().push(correction);
        }
        Ok(())
    }

    fn proc_start(&self) -> Result<(), Errno> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn proc_stop(&self) -> Result<(), Errno> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn map_shared(&self, words: usize) -> Result<SharedRegion, Errno> {
        assert!(words <= MOCK_REGION_WORDS, "mock region too small");
        let ptr = std::ptr::NonNull::new(self.mem.as_ptr() as *mut i32).unwrap();
        Ok(SharedRegion::borrowed(ptr, words))
    }

    fn close_device(&self) -> Result<(), Errno> {
        Ok(())
    }
}

/// Write a full parameter surface into `dir`.
pub fn write_params(
    dir: &Path,
    sample_rate: i32,
    input_chans: i32,
    output_chans: i32,
    buffer_size: i32,
    format: i32,
    platform: i32,
) {
    let entries = [
        ("audio_sampling_rate", sample_rate),
        ("audio_input_channels", input_chans),
        ("audio_output_channels", output_chans),
        ("audio_buffer_size", buffer_size),
        ("audio_format", format),
        ("platform_type", platform),
        ("audio_ver_maj", 0),
        ("audio_ver_min", 2),
        ("usb_audio_type", 0),
        ("audio_irq_affinity", 0),
    ];
    for (name, value) in entries {
        std::fs::write(dir.join(name), format!("{value}\n")).unwrap();
    }
}

/// Engine wired to the mock transport, parameter surface in `dir`, and
/// per-test socket endpoints under `dir`.
pub fn engine_with_mock(dir: &Path, mock: &Arc<MockDriver>) -> RaspaEngine {
    let mock = Arc::clone(mock);
    RaspaEngine::new(
        DriverConfig::new(dir),
        Box::new(move |_| Ok(Arc::clone(&mock) as Arc<dyn DriverTransport>)),
        GpioSocketPaths {
            local: dir.join("raspa.sock"),
            peer: dir.join("daemon.sock"),
        },
    )
}

/// Poll until the mock has served `periods` or the deadline passes.
pub fn wait_for_periods(mock: &MockDriver, periods: u64, deadline: Duration) {
    let end = std::time::Instant::now() + deadline;
    while mock.periods_served() < periods {
        assert!(
            std::time::Instant::now() < end,
            "timed out waiting for {periods} periods (served {})",
            mock.periods_served()
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}
