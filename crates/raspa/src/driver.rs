//! Kernel driver access: device node, ioctls, shared-memory mapping and the
//! word-offset layout of the shared image.
//!
//! All driver access goes through [`DriverTransport`] so the engine is
//! indifferent to which real-time runtime backs the character device; the
//! test suite substitutes a scripted transport.

use std::fs::OpenOptions;
use std::os::fd::IntoRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;

use crate::config::PlatformType;
use crate::packet::{DEVICE_CTRL_PKT_SIZE_WORDS, PKT_SIZE_WORDS};

/// Character device exposed by the RTDM (Xenomai Cobalt) driver build.
pub const DEVICE_PATH_RTDM: &str = "/dev/rtdm/audio_rtdm";

/// Character device exposed by the EVL driver build.
pub const DEVICE_PATH_EVL: &str = "/dev/evl/audio_rtdm";

/// Kernel pages the driver maps for userspace.
pub const NUM_PAGES_KERNEL_MEM: usize = 20;

/// Double-buffer depth per direction.
pub const NUM_BUFFERS: usize = 2;

/// errno values `open()` uses to report specific companion failures.
const OPEN_ERR_INVALID_BUFFER_SIZE: Errno = Errno::EINVAL;
const OPEN_ERR_DEVICE_INACTIVE: Errno = Errno::ETIMEDOUT;
const OPEN_ERR_INVALID_FIRMWARE: Errno = Errno::EPROTO;

const IOC_MAGIC: u8 = b'r';

mod ioctls {
    use super::IOC_MAGIC;

    nix::ioctl_read_bad!(
        irq_wait,
        nix::request_code_none!(IOC_MAGIC, 1),
        libc::c_int
    );
    nix::ioctl_none!(proc_start, IOC_MAGIC, 3);
    nix::ioctl_write_ptr!(userproc_finished, IOC_MAGIC, 4, libc::c_int);
    nix::ioctl_none!(proc_stop, IOC_MAGIC, 5);
    nix::ioctl_write_ptr!(fw_transfer, IOC_MAGIC, 6, super::RtGpio);
    nix::ioctl_readwrite!(gpio_get_pin, IOC_MAGIC, 7, super::RtGpio);
    nix::ioctl_write_ptr!(gpio_set_dir_out, IOC_MAGIC, 8, super::RtGpio);
    nix::ioctl_write_ptr!(gpio_set_val, IOC_MAGIC, 9, super::RtGpio);
    nix::ioctl_write_ptr!(gpio_release, IOC_MAGIC, 10, super::RtGpio);
}

/// GPIO request record shared with the driver.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RtGpio {
    pub num: libc::c_int,
    pub dir: libc::c_int,
    pub val: libc::c_int,
}

/// Why the device refused to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOpenError {
    /// Driver was configured with a buffer size it cannot serve.
    InvalidBufferSize,
    /// Companion microcontroller did not respond.
    DeviceInactive,
    /// Companion firmware does not match the driver.
    InvalidFirmware,
    Other(Errno),
}

/// Shared memory handed out by the driver (or the mock).
///
/// Owns the mapping when `mapped` is set; a mock region borrows memory owned
/// elsewhere and unmapping it is a no-op.
pub struct SharedRegion {
    ptr: NonNull<i32>,
    words: usize,
    mapped: bool,
}

unsafe impl Send for SharedRegion {}

impl SharedRegion {
    /// Wrap memory owned by the caller; used by mock transports. The caller
    /// must keep the memory alive for the lifetime of the region.
    pub fn borrowed(ptr: NonNull<i32>, words: usize) -> Self {
        Self {
            ptr,
            words,
            mapped: false,
        }
    }

    pub fn as_ptr(&self) -> *mut i32 {
        self.ptr.as_ptr()
    }

    pub fn words(&self) -> usize {
        self.words
    }

    /// Zero the whole region.
    pub fn clear(&mut self) {
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.words);
        }
    }

    pub fn unmap(&mut self) -> Result<(), Errno> {
        if !self.mapped {
            return Ok(());
        }
        self.mapped = false;
        let res = unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.words * 4)
        };
        if res != 0 {
            return Err(Errno::last());
        }
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        let _ = self.unmap();
    }
}

/// Word offsets of every piece of the shared image, computed by summation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmLayout {
    pub audio_in: [usize; NUM_BUFFERS],
    pub audio_out: [usize; NUM_BUFFERS],
    /// Gate words, native platform only.
    pub cv_out: Option<usize>,
    pub cv_in: Option<usize>,
    /// Control packets, companion platforms only.
    pub rx_pkt: [Option<usize>; NUM_BUFFERS],
    pub tx_pkt: [Option<usize>; NUM_BUFFERS],
    /// Words the layout spans, for bounds checking against the mapping.
    pub total_words: usize,
}

impl ShmLayout {
    /// `buffer_words` is frames x codec channels, the size of one audio slot.
    pub fn for_platform(platform: PlatformType, buffer_words: usize) -> Self {
        match platform {
            PlatformType::Native => Self::native(buffer_words),
            PlatformType::Sync | PlatformType::Async => Self::companion(buffer_words),
        }
    }

    /// `rx[0] rx[1] tx[0] tx[1] cv_out cv_in`, contiguous.
    fn native(buffer_words: usize) -> Self {
        let audio_in = [0, buffer_words];
        let audio_out = [2 * buffer_words, 3 * buffer_words];
        let cv_out = 4 * buffer_words;
        let cv_in = cv_out + 1;
        Self {
            audio_in,
            audio_out,
            cv_out: Some(cv_out),
            cv_in: Some(cv_in),
            rx_pkt: [None, None],
            tx_pkt: [None, None],
            total_words: cv_in + 1,
        }
    }

    /// Each audio slot is preceded by a device-control block and an
    /// audio-control packet; rx slots first, then tx.
    fn companion(buffer_words: usize) -> Self {
        let mut offset = 0usize;
        let mut pkt = [0usize; 2 * NUM_BUFFERS];
        let mut audio = [0usize; 2 * NUM_BUFFERS];
        for slot in 0..2 * NUM_BUFFERS {
            offset += DEVICE_CTRL_PKT_SIZE_WORDS;
            pkt[slot] = offset;
            offset += PKT_SIZE_WORDS;
            audio[slot] = offset;
            offset += buffer_words;
        }
        Self {
            audio_in: [audio[0], audio[1]],
            audio_out: [audio[2], audio[3]],
            cv_out: None,
            cv_in: None,
            rx_pkt: [Some(pkt[0]), Some(pkt[1])],
            tx_pkt: [Some(pkt[2]), Some(pkt[3])],
            total_words: offset,
        }
    }
}

/// Seam between the engine and the kernel driver.
///
/// The two ioctls the RT loop issues every period (`irq_wait`,
/// `userproc_finished`) are the only suspension points of the processing
/// thread; everything else is called from non-RT context.
pub trait DriverTransport: Send + Sync {
    /// Block until the next period; returns the buffer index to work on.
    fn irq_wait(&self) -> Result<usize, Errno>;

    /// Signal the period complete, optionally carrying a timing correction
    /// in nanoseconds (sync platforms).
    fn userproc_finished(&self, correction_ns: Option<i32>) -> Result<(), Errno>;

    fn proc_start(&self) -> Result<(), Errno>;

    fn proc_stop(&self) -> Result<(), Errno>;

    /// Map the driver's shared image; `words` is the mapping size in 32-bit
    /// words.
    fn map_shared(&self, words: usize) -> Result<SharedRegion, Errno>;

    fn close_device(&self) -> Result<(), Errno>;

    /// Arm the host runtime's mode-switch diagnostics, where supported.
    fn arm_mode_switch_warning(&self) {}

    fn gpio_request_out(&self, _pin: i32) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }

    fn gpio_set(&self, _pin: i32, _val: i32) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }

    fn gpio_release(&self, _pin: i32) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }
}

/// Production transport over the audio character device.
pub struct RtdmDriver {
    fd: libc::c_int,
    closed: AtomicBool,
}

impl RtdmDriver {
    /// Path of whichever driver build is present; EVL wins when both exist.
    pub fn device_path() -> &'static str {
        if std::path::Path::new(DEVICE_PATH_EVL).exists() {
            DEVICE_PATH_EVL
        } else {
            DEVICE_PATH_RTDM
        }
    }

    /// Kick off a firmware transfer to the companion microcontroller. Not
    /// part of the audio path; used by provisioning tools.
    pub fn fw_transfer(&self, record: &RtGpio) -> Result<(), Errno> {
        unsafe { ioctls::fw_transfer(self.fd, record) }?;
        Ok(())
    }

    /// Open the device, translating the driver's errno conventions. The
    /// platform type decides whether companion errnos are meaningful.
    pub fn open(platform: PlatformType) -> Result<Self, DeviceOpenError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(Self::device_path())
            .map_err(|err| {
                let errno = Errno::from_raw(err.raw_os_error().unwrap_or(0));
                if errno == OPEN_ERR_INVALID_BUFFER_SIZE {
                    DeviceOpenError::InvalidBufferSize
                } else if platform != PlatformType::Native {
                    match errno {
                        OPEN_ERR_DEVICE_INACTIVE => DeviceOpenError::DeviceInactive,
                        OPEN_ERR_INVALID_FIRMWARE => DeviceOpenError::InvalidFirmware,
                        other => DeviceOpenError::Other(other),
                    }
                } else {
                    DeviceOpenError::Other(errno)
                }
            })?;

        Ok(Self {
            fd: file.into_raw_fd(),
            closed: AtomicBool::new(false),
        })
    }
}

impl DriverTransport for RtdmDriver {
    fn irq_wait(&self) -> Result<usize, Errno> {
        let mut index: libc::c_int = 0;
        unsafe { ioctls::irq_wait(self.fd, &mut index) }?;
        Ok((index & 1) as usize)
    }

    fn userproc_finished(&self, correction_ns: Option<i32>) -> Result<(), Errno> {
        match correction_ns {
            Some(correction) => {
                let value: libc::c_int = correction;
                unsafe { ioctls::userproc_finished(self.fd, &value) }?;
            }
            None => {
                let res = unsafe {
                    libc::ioctl(
                        self.fd,
                        nix::request_code_write!(
                            IOC_MAGIC,
                            4,
                            std::mem::size_of::<libc::c_int>()
                        ) as libc::c_ulong,
                        std::ptr::null::<libc::c_int>(),
                    )
                };
                if res < 0 {
                    return Err(Errno::last());
                }
            }
        }
        Ok(())
    }

    fn proc_start(&self) -> Result<(), Errno> {
        unsafe { ioctls::proc_start(self.fd) }?;
        Ok(())
    }

    fn proc_stop(&self) -> Result<(), Errno> {
        unsafe { ioctls::proc_stop(self.fd) }?;
        Ok(())
    }

    fn map_shared(&self, words: usize) -> Result<SharedRegion, Errno> {
        let bytes = words * 4;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Errno::last());
        }
        let ptr = NonNull::new(ptr as *mut i32).ok_or(Errno::ENOMEM)?;
        Ok(SharedRegion {
            ptr,
            words,
            mapped: true,
        })
    }

    fn close_device(&self) -> Result<(), Errno> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let res = unsafe { libc::close(self.fd) };
        if res != 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    fn gpio_request_out(&self, pin: i32) -> Result<(), Errno> {
        let mut gpio = RtGpio {
            num: pin,
            ..Default::default()
        };
        unsafe { ioctls::gpio_get_pin(self.fd, &mut gpio) }?;
        unsafe { ioctls::gpio_set_dir_out(self.fd, &gpio) }?;
        Ok(())
    }

    fn gpio_set(&self, pin: i32, val: i32) -> Result<(), Errno> {
        let gpio = RtGpio {
            num: pin,
            dir: 0,
            val,
        };
        unsafe { ioctls::gpio_set_val(self.fd, &gpio) }?;
        Ok(())
    }

    fn gpio_release(&self, pin: i32) -> Result<(), Errno> {
        let gpio = RtGpio {
            num: pin,
            ..Default::default()
        };
        unsafe { ioctls::gpio_release(self.fd, &gpio) }?;
        Ok(())
    }
}

impl Drop for RtdmDriver {
    fn drop(&mut self) {
        let _ = self.close_device();
    }
}
