//! The real-time engine: owns the driver mappings, spawns the processing
//! thread and drives the interrupt-wait / process / finish cycle.
//!
//! One processing thread exists per open instance, pinned to CPU 0 under
//! SCHED_FIFO. In steady state the loop suspends only in the two driver
//! ioctls; everything in between is branch-limited arithmetic over memory
//! allocated at open time.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use raspa_rt::thread as rt_thread;
use raspa_rt::thread::monotonic_micros;

use crate::config::{interleaved_layout, DriverConfig, PlatformType};
use crate::convert::{build_channel_converters, SampleConverter};
use crate::dll::{CorrectionDownsampler, DELAY_FILTER_SETTLING_PERIODS};
use crate::driver::{
    DeviceOpenError, DriverTransport, RtdmDriver, SharedRegion, ShmLayout, NUM_BUFFERS,
    NUM_PAGES_KERNEL_MEM,
};
use crate::error::{ErrorKind, RaspaError};
use crate::gpio::{GpioBridge, GpioSocketPaths};
use crate::packet::{AudioCtrlPkt, MAX_GPIO_BLOBS_PER_PKT};
use crate::run_log::{RunLogHandle, RunLogger, RUN_LOG_DEFAULT_PATH};

/// Debug flag: arm the host runtime's mode-switch diagnostics.
pub const DEBUG_SIGNAL_ON_MODE_SW: u32 = 1 << 0;

/// Debug flag: record per-period timestamps to the run log file.
pub const DEBUG_ENABLE_RUN_LOG: u32 = 1 << 1;

/// SCHED_FIFO priority of the processing thread.
pub const PROCESSING_TASK_PRIORITY: i32 = 90;

/// Wait for the driver to tear down its transfers after proc-stop.
const CLOSE_DELAY: Duration = Duration::from_millis(500);

/// Window for the RT loop to emit a cease packet (or silence) after the stop
/// flag is raised.
const STOP_REQUEST_DELAY: Duration = Duration::from_millis(10);

/// Settle time after spawning the RT thread before touching affinities.
const THREAD_CREATE_DELAY: Duration = Duration::from_millis(10);

/// Audio processing callback: planar input and output buffers of
/// `frames x total_channels` samples, valid for the duration of one call.
pub type ProcessCallback = Box<dyn FnMut(&[f32], &mut [f32]) + Send>;

/// Builds the transport when the engine opens; the platform type is known by
/// then and decides how open errnos are interpreted.
pub type TransportFactory =
    Box<dyn Fn(PlatformType) -> Result<Arc<dyn DriverTransport>, DeviceOpenError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initialized,
    Opened,
    Running,
}

/// State shared between the RT loop and the public API, all lock-free.
struct EngineShared {
    stop: AtomicBool,
    break_on_mode_sw: AtomicBool,
    gate_in: AtomicU32,
    gate_out: AtomicU32,
    interrupts: AtomicU64,
}

impl EngineShared {
    fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            break_on_mode_sw: AtomicBool::new(false),
            gate_in: AtomicU32::new(0),
            gate_out: AtomicU32::new(0),
            interrupts: AtomicU64::new(0),
        }
    }
}

/// 16-byte-aligned float buffer handed to the user callback.
struct AlignedF32Buf {
    ptr: NonNull<f32>,
    len: usize,
}

unsafe impl Send for AlignedF32Buf {}

impl AlignedF32Buf {
    fn zeroed(len: usize) -> Result<Self, RaspaError> {
        let layout = Layout::from_size_align(len * 4, 16)
            .map_err(|_| RaspaError::new(ErrorKind::UserBuffers))?;
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw as *mut f32)
            .ok_or_else(|| RaspaError::with_errno(ErrorKind::UserBuffers, libc::ENOMEM))?;
        Ok(Self { ptr, len })
    }

    fn as_slice(&self) -> &[f32] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [f32] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedF32Buf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len * 4, 16).expect("valid by construction");
        unsafe { std::alloc::dealloc(self.ptr.as_ptr() as *mut u8, layout) };
    }
}

/// Resolved pointers into the shared image. Only the RT thread dereferences
/// them while the loop runs.
struct SharedPointers {
    audio_in: [*mut i32; NUM_BUFFERS],
    audio_out: [*mut i32; NUM_BUFFERS],
    cv_in: *mut u32,
    cv_out: *mut u32,
    rx_pkt: [*mut AudioCtrlPkt; NUM_BUFFERS],
    tx_pkt: [*mut AudioCtrlPkt; NUM_BUFFERS],
    buffer_words: usize,
}

unsafe impl Send for SharedPointers {}

impl SharedPointers {
    fn resolve(region: &SharedRegion, layout: &ShmLayout, buffer_words: usize) -> Self {
        let base = region.as_ptr();
        let word = |offset: usize| unsafe { base.add(offset) };
        let opt_word = |offset: Option<usize>| {
            offset.map(word).unwrap_or(std::ptr::null_mut())
        };
        Self {
            audio_in: [word(layout.audio_in[0]), word(layout.audio_in[1])],
            audio_out: [word(layout.audio_out[0]), word(layout.audio_out[1])],
            cv_in: opt_word(layout.cv_in) as *mut u32,
            cv_out: opt_word(layout.cv_out) as *mut u32,
            rx_pkt: [
                opt_word(layout.rx_pkt[0]) as *mut AudioCtrlPkt,
                opt_word(layout.rx_pkt[1]) as *mut AudioCtrlPkt,
            ],
            tx_pkt: [
                opt_word(layout.tx_pkt[0]) as *mut AudioCtrlPkt,
                opt_word(layout.tx_pkt[1]) as *mut AudioCtrlPkt,
            ],
            buffer_words,
        }
    }
}

/// Everything the processing thread owns once started.
struct RtContext {
    transport: Arc<dyn DriverTransport>,
    shared: Arc<EngineShared>,
    ptrs: SharedPointers,
    user_in: AlignedF32Buf,
    user_out: AlignedF32Buf,
    input_converters: Vec<Box<dyn SampleConverter>>,
    output_converters: Vec<Box<dyn SampleConverter>>,
    callback: ProcessCallback,
    platform: PlatformType,
    filter: Option<CorrectionDownsampler>,
    gpio: Option<Arc<GpioBridge>>,
    run_log: Option<RunLogHandle>,
    seq: u32,
}

impl RtContext {
    fn run(mut self) {
        match self.platform {
            PlatformType::Native => self.run_native(),
            PlatformType::Async => self.run_async(),
            PlatformType::Sync => self.run_sync(),
        }
    }

    #[inline]
    fn audio_out(&mut self, idx: usize) -> &mut [i32] {
        unsafe {
            std::slice::from_raw_parts_mut(self.ptrs.audio_out[idx], self.ptrs.buffer_words)
        }
    }

    /// Run every per-channel converter and the user callback for one period.
    fn perform_user_callback(&mut self, idx: usize) {
        let src = unsafe {
            std::slice::from_raw_parts(self.ptrs.audio_in[idx], self.ptrs.buffer_words)
        };
        for converter in &self.input_converters {
            converter.to_float(self.user_in.as_mut_slice(), src);
        }

        (self.callback)(self.user_in.as_slice(), self.user_out.as_mut_slice());

        let dst = unsafe {
            std::slice::from_raw_parts_mut(self.ptrs.audio_out[idx], self.ptrs.buffer_words)
        };
        for converter in &self.output_converters {
            converter.to_int(dst, self.user_out.as_slice());
        }
    }

    fn zero_outputs(&mut self) {
        for idx in 0..NUM_BUFFERS {
            self.audio_out(idx).fill(0);
        }
    }

    /// One-shot arming of the host runtime's mode-switch diagnostics after
    /// the startup periods are through.
    #[inline]
    fn maybe_arm_mode_switch(&self) {
        if self.shared.break_on_mode_sw.load(Ordering::Relaxed)
            && self.shared.interrupts.load(Ordering::Relaxed) > 1
        {
            self.transport.arm_mode_switch_warning();
            self.shared.break_on_mode_sw.store(false, Ordering::Relaxed);
        }
    }

    /// Hand any GPIO payload of a validated rx packet to the bridge. A full
    /// ring drops the blob at the sender.
    fn parse_rx_pkt(&mut self, pkt: &AudioCtrlPkt) {
        if !pkt.is_valid() {
            return;
        }

        let num_blobs = pkt.gpio_blob_count();
        if num_blobs > 0 {
            if let Some(gpio) = &self.gpio {
                for i in 0..num_blobs {
                    let _ = gpio.try_push_to_nrt(pkt.gpio_blob(i));
                }
            }
        }
    }

    /// Select the next tx packet: cease while stopping, GPIO payload when the
    /// bridge has blobs queued, default otherwise.
    fn next_tx_pkt(&mut self, pkt: &mut AudioCtrlPkt, stopping: bool) {
        if stopping {
            // sequence stays put, the companion only looks at the command
            pkt.prepare_audio_cease(self.seq);
            return;
        }

        let has_outbound = self.gpio.as_ref().is_some_and(|g| g.has_outbound());
        if has_outbound {
            self.seq = self.seq.wrapping_add(1);
            pkt.make_default(self.seq);

            let gpio = self.gpio.as_ref().expect("checked above");
            let mut num_blobs = 0;
            while num_blobs < MAX_GPIO_BLOBS_PER_PKT {
                let Some(blob) = gpio.try_pop_from_nrt() else {
                    break;
                };
                pkt.set_gpio_blob(num_blobs, &blob);
                num_blobs += 1;
            }
            pkt.set_gpio_cmd(num_blobs);
            return;
        }

        pkt.make_default(self.seq);
    }

    fn run_native(&mut self) {
        loop {
            let idx = match self.transport.irq_wait() {
                Ok(idx) => idx & 1,
                Err(_) => break,
            };
            let start_us = if self.run_log.is_some() {
                monotonic_micros()
            } else {
                0
            };

            self.maybe_arm_mode_switch();

            if self.shared.stop.load(Ordering::Acquire) {
                self.zero_outputs();
            } else {
                let gate_in = unsafe { self.ptrs.cv_in.read() };
                self.shared.gate_in.store(gate_in, Ordering::Release);

                self.perform_user_callback(idx);

                let gate_out = self.shared.gate_out.load(Ordering::Acquire);
                unsafe { self.ptrs.cv_out.write(gate_out) };
            }

            if self.transport.userproc_finished(None).is_err() {
                break;
            }
            if let Some(log) = &self.run_log {
                log.put(start_us, monotonic_micros());
            }
            self.shared.interrupts.fetch_add(1, Ordering::Release);
        }
    }

    fn run_async(&mut self) {
        loop {
            let idx = match self.transport.irq_wait() {
                Ok(idx) => idx & 1,
                Err(_) => break,
            };
            let start_us = if self.run_log.is_some() {
                monotonic_micros()
            } else {
                0
            };

            self.maybe_arm_mode_switch();

            let rx = unsafe { self.ptrs.rx_pkt[idx].read() };
            let stopping = self.shared.stop.load(Ordering::Acquire);

            self.shared.gate_in.store(rx.gate_in(), Ordering::Release);
            self.parse_rx_pkt(&rx);

            if stopping {
                self.zero_outputs();
            } else {
                self.perform_user_callback(idx);
            }

            let mut tx = AudioCtrlPkt::default();
            self.next_tx_pkt(&mut tx, stopping);
            tx.set_gate_out(self.shared.gate_out.load(Ordering::Acquire));
            unsafe { self.ptrs.tx_pkt[idx].write(tx) };

            if self.transport.userproc_finished(None).is_err() {
                break;
            }
            if let Some(log) = &self.run_log {
                log.put(start_us, monotonic_micros());
            }
            self.shared.interrupts.fetch_add(1, Ordering::Release);
        }
    }

    fn run_sync(&mut self) {
        // Warm-up: drive the control-packet layer and the filter so it
        // converges, but keep the user callback out of it.
        while self.shared.interrupts.load(Ordering::Relaxed) < DELAY_FILTER_SETTLING_PERIODS {
            let idx = match self.transport.irq_wait() {
                Ok(idx) => idx & 1,
                Err(_) => return,
            };

            let rx = unsafe { self.ptrs.rx_pkt[idx].read() };
            let correction_ns = self.correction_for(&rx);
            let stopping = self.shared.stop.load(Ordering::Acquire);

            self.parse_rx_pkt(&rx);

            let mut tx = AudioCtrlPkt::default();
            self.next_tx_pkt(&mut tx, stopping);
            unsafe { self.ptrs.tx_pkt[idx].write(tx) };

            if self.transport.userproc_finished(Some(correction_ns)).is_err() {
                return;
            }
            self.shared.interrupts.fetch_add(1, Ordering::Release);
        }

        loop {
            let idx = match self.transport.irq_wait() {
                Ok(idx) => idx & 1,
                Err(_) => break,
            };
            let start_us = if self.run_log.is_some() {
                monotonic_micros()
            } else {
                0
            };

            self.maybe_arm_mode_switch();

            let rx = unsafe { self.ptrs.rx_pkt[idx].read() };
            let correction_ns = self.correction_for(&rx);
            let stopping = self.shared.stop.load(Ordering::Acquire);

            self.shared.gate_in.store(rx.gate_in(), Ordering::Release);
            self.parse_rx_pkt(&rx);

            if stopping {
                self.zero_outputs();
            } else {
                self.perform_user_callback(idx);
            }

            let mut tx = AudioCtrlPkt::default();
            self.next_tx_pkt(&mut tx, stopping);
            tx.set_gate_out(self.shared.gate_out.load(Ordering::Acquire));
            unsafe { self.ptrs.tx_pkt[idx].write(tx) };

            if self.transport.userproc_finished(Some(correction_ns)).is_err() {
                break;
            }
            if let Some(log) = &self.run_log {
                log.put(start_us, monotonic_micros());
            }
            self.shared.interrupts.fetch_add(1, Ordering::Release);
        }
    }

    #[inline]
    fn correction_for(&mut self, rx: &AudioCtrlPkt) -> i32 {
        let error_ns = rx.timing_error_ns();
        self.filter
            .as_mut()
            .map(|filter| filter.process(error_ns))
            .unwrap_or(0)
    }
}

pub struct RaspaEngine {
    cfg: DriverConfig,
    gpio_paths: GpioSocketPaths,
    transport_factory: TransportFactory,

    state: EngineState,
    shared: Arc<EngineShared>,

    transport: Option<Arc<dyn DriverTransport>>,
    region: Option<SharedRegion>,
    rt_ctx: Option<RtContext>,
    rt_thread: Option<JoinHandle<()>>,
    gpio: Option<Arc<GpioBridge>>,
    run_logger: Option<RunLogger>,

    sample_rate: f32,
    num_input_chans: usize,
    num_output_chans: usize,
    num_codec_chans: usize,
    frames: usize,
    samples: usize,
    platform: PlatformType,
}

impl RaspaEngine {
    /// Engine over the production driver and the default socket endpoints.
    pub fn with_default_driver() -> Self {
        Self::new(
            DriverConfig::default(),
            Box::new(|platform| {
                RtdmDriver::open(platform).map(|d| Arc::new(d) as Arc<dyn DriverTransport>)
            }),
            GpioSocketPaths::default(),
        )
    }

    /// Engine over an arbitrary transport; this is the seam the test suite
    /// and alternate RT runtimes plug into.
    pub fn new(
        cfg: DriverConfig,
        transport_factory: TransportFactory,
        gpio_paths: GpioSocketPaths,
    ) -> Self {
        Self {
            cfg,
            gpio_paths,
            transport_factory,
            state: EngineState::Initialized,
            shared: Arc::new(EngineShared::new()),
            transport: None,
            region: None,
            rt_ctx: None,
            rt_thread: None,
            gpio: None,
            run_logger: None,
            sample_rate: 0.0,
            num_input_chans: 0,
            num_output_chans: 0,
            num_codec_chans: 0,
            frames: 0,
            samples: 0,
            platform: PlatformType::Native,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Validate the driver, map its buffers and build the whole RT context.
    /// Any failure reverses the steps already completed, in reverse order.
    pub fn open(
        &mut self,
        buffer_size: usize,
        callback: impl FnMut(&[f32], &mut [f32]) + Send + 'static,
        debug_flags: u32,
    ) -> Result<(), RaspaError> {
        if self.state != EngineState::Initialized {
            return Err(RaspaError::with_errno(ErrorKind::DeviceOpen, libc::EBUSY));
        }

        let result = self.open_inner(buffer_size, Box::new(callback), debug_flags);
        if result.is_err() {
            let _ = self.cleanup();
        } else {
            self.state = EngineState::Opened;
        }
        result
    }

    fn open_inner(
        &mut self,
        buffer_size: usize,
        callback: ProcessCallback,
        debug_flags: u32,
    ) -> Result<(), RaspaError> {
        self.cfg.check_version()?;

        let sample_rate = self.cfg.sample_rate()?;
        if sample_rate < 0 {
            return Err(RaspaError::with_errno(ErrorKind::ParamSampleRate, sample_rate));
        }
        let num_input_chans = self.cfg.num_input_channels()?;
        if num_input_chans < 0 {
            return Err(RaspaError::with_errno(
                ErrorKind::ParamInputChans,
                num_input_chans,
            ));
        }
        let num_output_chans = self.cfg.num_output_channels()?;
        if num_output_chans < 0 {
            return Err(RaspaError::with_errno(
                ErrorKind::ParamOutputChans,
                num_output_chans,
            ));
        }
        let codec_format = self.cfg.codec_format()?;
        let platform = self.cfg.platform_type()?;

        let driver_buffer_size = self.cfg.buffer_size()?;
        if driver_buffer_size < 0 {
            return Err(RaspaError::with_errno(
                ErrorKind::ParamBufferSize,
                driver_buffer_size,
            ));
        }
        if driver_buffer_size as usize != buffer_size {
            return Err(RaspaError::new(ErrorKind::BufferSizeMismatch));
        }

        self.sample_rate = sample_rate as f32;
        self.num_input_chans = num_input_chans as usize;
        self.num_output_chans = num_output_chans as usize;
        self.num_codec_chans = self.num_input_chans.max(self.num_output_chans);
        self.frames = buffer_size;
        self.samples = self.frames * self.num_codec_chans;
        self.platform = platform;

        if self.samples == 0 {
            return Err(RaspaError::new(ErrorKind::BufferSizeUnsupported));
        }

        self.shared.stop.store(false, Ordering::Release);
        self.shared.interrupts.store(0, Ordering::Release);
        self.shared
            .break_on_mode_sw
            .store(debug_flags & DEBUG_SIGNAL_ON_MODE_SW != 0, Ordering::Release);

        let transport = (self.transport_factory)(platform).map_err(|err| match err {
            DeviceOpenError::InvalidBufferSize => RaspaError::new(ErrorKind::BufferSizeInvalid),
            DeviceOpenError::DeviceInactive => RaspaError::new(ErrorKind::DeviceInactive),
            DeviceOpenError::InvalidFirmware => RaspaError::new(ErrorKind::DeviceFirmware),
            DeviceOpenError::Other(errno) => {
                RaspaError::with_errno(ErrorKind::DeviceOpen, errno as i32)
            }
        })?;
        self.transport = Some(Arc::clone(&transport));

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(4096) as usize;
        let region_words = NUM_PAGES_KERNEL_MEM * page_size / 4;
        let mut region = transport
            .map_shared(region_words)
            .map_err(|errno| RaspaError::with_errno(ErrorKind::Mmap, errno as i32))?;

        let layout = ShmLayout::for_platform(platform, self.samples);
        if layout.total_words > region.words() {
            let _ = region.unmap();
            return Err(RaspaError::with_errno(ErrorKind::Mmap, libc::EINVAL));
        }
        region.clear();

        let ptrs = SharedPointers::resolve(&region, &layout, self.samples);
        self.region = Some(region);

        let user_in = AlignedF32Buf::zeroed(self.samples)?;
        let user_out = AlignedF32Buf::zeroed(self.samples)?;

        let channel_layout = interleaved_layout(self.num_codec_chans);
        let input_converters = build_channel_converters(
            codec_format,
            self.frames,
            &channel_layout[..self.num_input_chans],
        )?;
        let output_converters = build_channel_converters(
            codec_format,
            self.frames,
            &channel_layout[..self.num_output_chans],
        )?;

        let filter = (platform == PlatformType::Sync)
            .then(|| CorrectionDownsampler::new(DELAY_FILTER_SETTLING_PERIODS as u32));

        let gpio = if platform != PlatformType::Native {
            let bridge = Arc::new(GpioBridge::start(&self.gpio_paths)?);
            self.gpio = Some(Arc::clone(&bridge));
            Some(bridge)
        } else {
            None
        };

        let run_log = if debug_flags & DEBUG_ENABLE_RUN_LOG != 0 {
            let logger = RunLogger::start(std::path::Path::new(RUN_LOG_DEFAULT_PATH))?;
            let handle = logger.handle();
            self.run_logger = Some(logger);
            Some(handle)
        } else {
            None
        };

        self.rt_ctx = Some(RtContext {
            transport,
            shared: Arc::clone(&self.shared),
            ptrs,
            user_in,
            user_out,
            input_converters,
            output_converters,
            callback,
            platform,
            filter,
            gpio,
            run_log,
            seq: 0,
        });

        Ok(())
    }

    /// Spawn the processing thread and tell the driver to start serving
    /// periods. The spawning thread is left pinned by the RT setup and gets
    /// its full affinity back before this returns.
    pub fn start_realtime(&mut self) -> Result<(), RaspaError> {
        if self.state != EngineState::Opened {
            return Err(RaspaError::with_errno(ErrorKind::TaskStart, libc::EINVAL));
        }
        let ctx = self
            .rt_ctx
            .take()
            .ok_or_else(|| RaspaError::with_errno(ErrorKind::TaskStart, libc::EINVAL))?;

        let (affinity_tx, affinity_rx) = mpsc::channel();
        let spawn_result = std::thread::Builder::new()
            .name("raspa-processing".into())
            .spawn(move || {
                let pinned = rt_thread::pin_current_thread(0);
                let ok = pinned.is_ok();
                let _ = affinity_tx.send(pinned);
                if !ok {
                    return;
                }
                if let Err(err) = rt_thread::set_current_thread_fifo(PROCESSING_TASK_PRIORITY) {
                    tracing::warn!(
                        ?err,
                        "SCHED_FIFO election failed, processing thread runs unprivileged"
                    );
                }
                ctx.run();
            });

        let handle = match spawn_result {
            Ok(handle) => handle,
            Err(err) => {
                let err = RaspaError::from_os(ErrorKind::TaskCreate, &err);
                let _ = self.cleanup();
                return Err(err);
            }
        };
        self.rt_thread = Some(handle);

        match affinity_rx.recv_timeout(Duration::from_secs(1)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let err = RaspaError::from_os(ErrorKind::TaskAffinity, &err);
                let _ = self.cleanup();
                return Err(err);
            }
            Err(_) => {
                let err = RaspaError::with_errno(ErrorKind::TaskAffinity, libc::ETIMEDOUT);
                let _ = self.cleanup();
                return Err(err);
            }
        }

        std::thread::sleep(THREAD_CREATE_DELAY);
        if let Err(err) = rt_thread::open_affinity_to_all_cpus() {
            tracing::warn!(?err, "failed to restore caller affinity to all CPUs");
        }

        let transport = self.transport.as_ref().expect("opened");
        transport
            .proc_start()
            .map_err(|errno| RaspaError::with_errno(ErrorKind::TaskStart, errno as i32))?;

        self.state = EngineState::Running;
        Ok(())
    }

    /// Raise the stop flag, give the RT loop one cease window, stop the
    /// driver and release everything in reverse open order.
    pub fn close(&mut self) -> Result<(), RaspaError> {
        self.shared.stop.store(true, Ordering::Release);

        // let the periodic task mute the outputs / emit the cease packet
        std::thread::sleep(STOP_REQUEST_DELAY);

        let stop_result = match self.transport.as_ref() {
            Some(transport) => transport.proc_stop(),
            None => Ok(()),
        };

        // wait for the driver to stop current transfers
        std::thread::sleep(CLOSE_DELAY);

        if let Err(errno) = stop_result {
            let _ = self.cleanup();
            return Err(RaspaError::with_errno(ErrorKind::TaskStop, errno as i32));
        }

        self.cleanup()
    }

    /// Reverse of open: join the thread, drop the RT context (user buffers,
    /// converters), unmap, close the device, tear down bridge and logger.
    fn cleanup(&mut self) -> Result<(), RaspaError> {
        let mut result = Ok(());

        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.rt_thread.take() {
            if handle.join().is_err() {
                result = Err(RaspaError::new(ErrorKind::TaskCancel));
            }
        }

        self.rt_ctx = None;

        if let Some(mut region) = self.region.take() {
            if let Err(errno) = region.unmap() {
                result = result.and(Err(RaspaError::with_errno(
                    ErrorKind::Unmap,
                    errno as i32,
                )));
            }
        }

        if let Some(transport) = self.transport.take() {
            if let Err(errno) = transport.close_device() {
                result = result.and(Err(RaspaError::with_errno(
                    ErrorKind::DeviceClose,
                    errno as i32,
                )));
            }
        }

        // last Arc drops here and joins the bridge workers
        self.gpio = None;

        if let Some(mut logger) = self.run_logger.take() {
            result = result.and(logger.terminate());
        }

        self.state = EngineState::Initialized;
        result
    }

    pub fn sampling_rate(&self) -> f32 {
        if self.is_open() {
            self.sample_rate
        } else {
            0.0
        }
    }

    pub fn num_input_channels(&self) -> usize {
        if self.is_open() {
            self.num_input_chans
        } else {
            0
        }
    }

    pub fn num_output_channels(&self) -> usize {
        if self.is_open() {
            self.num_output_chans
        } else {
            0
        }
    }

    /// Total samples elapsed at the start of the current interrupt.
    pub fn samplecount(&self) -> i64 {
        if !self.is_open() {
            return 0;
        }
        self.shared.interrupts.load(Ordering::Acquire) as i64 * self.frames as i64
    }

    /// Monotonic timestamp in microseconds, 0 on clock failure.
    pub fn time_micros(&self) -> i64 {
        monotonic_micros()
    }

    /// Crude approximation: one buffer of samples worth of microseconds.
    pub fn output_latency_micros(&self) -> i64 {
        if self.is_open() && self.sample_rate > 0.0 {
            (self.samples as i64 * 1_000_000) / self.sample_rate as i64
        } else {
            0
        }
    }

    pub fn gate_values(&self) -> u32 {
        self.shared.gate_in.load(Ordering::Acquire)
    }

    pub fn set_gate_values(&self, gate_out: u32) {
        self.shared.gate_out.store(gate_out, Ordering::Release);
    }

    pub fn request_out_gpio(&self, pin: i32) -> Result<(), RaspaError> {
        self.with_transport(|t| t.gpio_request_out(pin))
    }

    pub fn set_gpio(&self, pin: i32, val: i32) -> Result<(), RaspaError> {
        self.with_transport(|t| t.gpio_set(pin, val))
    }

    pub fn free_gpio(&self, pin: i32) -> Result<(), RaspaError> {
        self.with_transport(|t| t.gpio_release(pin))
    }

    fn with_transport(
        &self,
        op: impl FnOnce(&dyn DriverTransport) -> Result<(), nix::errno::Errno>,
    ) -> Result<(), RaspaError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| RaspaError::new(ErrorKind::GpioUnsupported))?;
        op(transport.as_ref()).map_err(|_| RaspaError::new(ErrorKind::GpioUnsupported))
    }

    fn is_open(&self) -> bool {
        matches!(self.state, EngineState::Opened | EngineState::Running)
    }
}

impl Drop for RaspaEngine {
    fn drop(&mut self) {
        if self.state != EngineState::Initialized {
            let _ = self.close();
        }
    }
}
