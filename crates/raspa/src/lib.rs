//! RASPA
//! =====
//! Userspace runtime bridging a real-time audio kernel driver to a single
//! processing callback. The driver exposes a shared-memory double-buffer
//! pair plus control regions; raspa maps them, runs an interrupt-driven
//! processing thread, converts codec integers to normalized floats and back,
//! and acknowledges every period to the driver.
//!
//! ```no_run
//! raspa::init()?;
//! let mut handle = raspa::Raspa::open(
//!     64,
//!     |input, output| output.copy_from_slice(input),
//!     0,
//! )?;
//! handle.start_realtime()?;
//! // ... audio runs until ...
//! handle.close()?;
//! # Ok::<(), raspa::RaspaError>(())
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

pub mod config;
pub mod convert;
pub mod dll;
pub mod driver;
pub mod engine;
pub mod error;
pub mod gpio;
pub mod packet;
pub mod run_log;

pub use config::{CodecFormat, DriverConfig, PlatformType};
pub use engine::{RaspaEngine, DEBUG_ENABLE_RUN_LOG, DEBUG_SIGNAL_ON_MODE_SW};
pub use error::{error_text, ErrorKind, RaspaError};

static INIT_DONE: AtomicBool = AtomicBool::new(false);
static OPEN_GUARD: AtomicBool = AtomicBool::new(false);

/// Process-wide initialization: lock current and future pages into RAM so
/// the RT thread never takes a page fault. Call once before [`Raspa::open`];
/// repeated calls are no-ops.
pub fn init() -> Result<(), RaspaError> {
    if INIT_DONE.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    raspa_rt::thread::lock_all_memory().map_err(|err| {
        INIT_DONE.store(false, Ordering::SeqCst);
        RaspaError::from_os(ErrorKind::MlockAll, &err)
    })
}

/// Human-readable message for a (negative) error code returned by the API.
pub fn get_error_msg(code: i32) -> String {
    error_text(code)
}

/// Handle on one open runtime instance.
///
/// Only one instance can be open per process; a second [`Raspa::open`]
/// without an intervening close fails. Dropping the handle closes it.
pub struct Raspa {
    engine: RaspaEngine,
}

impl Raspa {
    /// Open against the production driver.
    pub fn open(
        buffer_size: usize,
        callback: impl FnMut(&[f32], &mut [f32]) + Send + 'static,
        debug_flags: u32,
    ) -> Result<Self, RaspaError> {
        Self::open_with(RaspaEngine::with_default_driver(), buffer_size, callback, debug_flags)
    }

    /// Open over a caller-supplied engine (alternate transport or parameter
    /// surface). The single-open-per-process rule still applies.
    pub fn open_with(
        mut engine: RaspaEngine,
        buffer_size: usize,
        callback: impl FnMut(&[f32], &mut [f32]) + Send + 'static,
        debug_flags: u32,
    ) -> Result<Self, RaspaError> {
        if OPEN_GUARD.swap(true, Ordering::SeqCst) {
            return Err(RaspaError::with_errno(ErrorKind::DeviceOpen, libc::EBUSY));
        }
        match engine.open(buffer_size, callback, debug_flags) {
            Ok(()) => Ok(Self { engine }),
            Err(err) => {
                OPEN_GUARD.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    pub fn start_realtime(&mut self) -> Result<(), RaspaError> {
        self.engine.start_realtime()
    }

    /// Stop processing, tell the driver and release every resource.
    pub fn close(mut self) -> Result<(), RaspaError> {
        self.engine.close()
        // the guard is released when `self` drops on return
    }

    pub fn sampling_rate(&self) -> f32 {
        self.engine.sampling_rate()
    }

    pub fn num_input_channels(&self) -> usize {
        self.engine.num_input_channels()
    }

    pub fn num_output_channels(&self) -> usize {
        self.engine.num_output_channels()
    }

    pub fn samplecount(&self) -> i64 {
        self.engine.samplecount()
    }

    pub fn time_micros(&self) -> i64 {
        self.engine.time_micros()
    }

    pub fn output_latency_micros(&self) -> i64 {
        self.engine.output_latency_micros()
    }

    pub fn gate_values(&self) -> u32 {
        self.engine.gate_values()
    }

    pub fn set_gate_values(&self, gate_out: u32) {
        self.engine.set_gate_values(gate_out)
    }

    pub fn request_out_gpio(&self, pin: i32) -> Result<(), RaspaError> {
        self.engine.request_out_gpio(pin)
    }

    pub fn set_gpio(&self, pin: i32, val: i32) -> Result<(), RaspaError> {
        self.engine.set_gpio(pin, val)
    }

    pub fn free_gpio(&self, pin: i32) -> Result<(), RaspaError> {
        self.engine.free_gpio(pin)
    }
}

impl Drop for Raspa {
    fn drop(&mut self) {
        OPEN_GUARD.store(false, Ordering::SeqCst);
    }
}
