//! Error taxonomy with a linux-errno side channel.
//!
//! Every failure the runtime can report maps to a stable integer code so the
//! negative-code convention of the public API survives the Rust surface.
//! The errno observed at failure time is stored in a process-wide table and
//! folded into the human-readable text on demand.

use std::collections::HashMap;

use nix::errno::Errno;
use parking_lot::Mutex;

/// Appended to parameter-class errors, which almost always mean the kernel
/// module is absent or stale.
const DRIVER_PARAM_ERROR_INFO: &str =
    "The driver might not have been loaded or has invalid configuration or version.";

/// Stable error kinds. The discriminant is the wire code; codes >= 200 are
/// parameter-read failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[repr(i32)]
#[non_exhaustive]
pub enum ErrorKind {
    #[error("Raspa: Buffer size mismatch with driver")]
    BufferSizeMismatch = 100,
    #[error("Raspa: Version mismatch with driver")]
    VersionMismatch = 101,
    #[error("Raspa: Failed to get buffers from driver")]
    Mmap = 102,
    #[error("Raspa: Failed to allocate user audio buffers")]
    UserBuffers = 103,
    #[error("Raspa: Failed to set affinity for RT task")]
    TaskAffinity = 104,
    #[error("Raspa: Failed to create RT task")]
    TaskCreate = 105,
    #[error("Raspa: Failed to start RT task")]
    TaskStart = 106,
    #[error("Raspa: Failed to stop RT task")]
    TaskStop = 107,
    #[error("Raspa: Failed to cancel RT task")]
    TaskCancel = 108,
    #[error("Raspa: Failed to unmap driver buffers")]
    Unmap = 109,
    #[error("Raspa: Failed to open driver")]
    DeviceOpen = 110,
    #[error("Raspa: Failed to close driver")]
    DeviceClose = 111,
    #[error("Raspa: Unsupported codec format")]
    CodecFormat = 112,
    #[error("Raspa: Unsupported platform type")]
    PlatformType = 113,
    #[error("Raspa: Incorrect firmware on external micro-controller")]
    DeviceFirmware = 114,
    #[error("Raspa: External micro-controller not responding")]
    DeviceInactive = 115,
    #[error("Raspa: Failed to create input socket for gpio data communication")]
    InputSocketCreation = 116,
    #[error("Raspa: Failed to create output socket for gpio data communication")]
    OutputSocketCreation = 117,
    #[error("Raspa: Failed to bind input socket to address")]
    InputSocketBind = 118,
    #[error("Raspa: Failed to set timeout on input socket")]
    InputSocketTimeout = 119,
    #[error("Raspa: Failed to lock memory needed to prevent page swapping")]
    MlockAll = 120,
    #[error("Raspa: driver configured with invalid buffer size")]
    BufferSizeInvalid = 121,
    #[error("Raspa: sample converter does not support specified buffer size")]
    BufferSizeUnsupported = 122,
    #[error("Raspa: gpio control is not supported by the driver")]
    GpioUnsupported = 123,
    #[error("Raspa: Failed to open run log file")]
    RunLogFileOpen = 124,
    #[error("Raspa: Failed to close run log file")]
    RunLogFileClose = 125,
    #[error("Raspa: Unable to read param from driver")]
    Param = 200,
    #[error("Raspa: Unable to read sample rate param from driver")]
    ParamSampleRate = 201,
    #[error("Raspa: Unable to read num input chans param from driver")]
    ParamInputChans = 202,
    #[error("Raspa: Unable to read num output chans param from driver")]
    ParamOutputChans = 203,
    #[error("Raspa: Unable to read codec format param from driver")]
    ParamCodecFormat = 204,
    #[error("Raspa: Unable to read platform type param from driver")]
    ParamPlatformType = 205,
    #[error("Raspa: Unable to read driver version param from driver")]
    ParamVersion = 206,
    #[error("Raspa: Unable to access buffer size param of driver")]
    ParamBufferSize = 207,
    #[error("Raspa: Unable to read usb audio type param from driver")]
    ParamUsbAudioType = 208,
    #[error("Raspa: Unable to read irq affinity param from driver")]
    ParamIrqAffinity = 209,
}

impl ErrorKind {
    /// Positive wire code. The public API reports `-code()`.
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        use ErrorKind::*;
        let code = code.abs();
        let kind = match code {
            100 => BufferSizeMismatch,
            101 => VersionMismatch,
            102 => Mmap,
            103 => UserBuffers,
            104 => TaskAffinity,
            105 => TaskCreate,
            106 => TaskStart,
            107 => TaskStop,
            108 => TaskCancel,
            109 => Unmap,
            110 => DeviceOpen,
            111 => DeviceClose,
            112 => CodecFormat,
            113 => PlatformType,
            114 => DeviceFirmware,
            115 => DeviceInactive,
            116 => InputSocketCreation,
            117 => OutputSocketCreation,
            118 => InputSocketBind,
            119 => InputSocketTimeout,
            120 => MlockAll,
            121 => BufferSizeInvalid,
            122 => BufferSizeUnsupported,
            123 => GpioUnsupported,
            124 => RunLogFileOpen,
            125 => RunLogFileClose,
            200 => Param,
            201 => ParamSampleRate,
            202 => ParamInputChans,
            203 => ParamOutputChans,
            204 => ParamCodecFormat,
            205 => ParamPlatformType,
            206 => ParamVersion,
            207 => ParamBufferSize,
            208 => ParamUsbAudioType,
            209 => ParamIrqAffinity,
            _ => return None,
        };
        Some(kind)
    }

    fn is_param(self) -> bool {
        self.code() >= ErrorKind::Param.code()
    }
}

/// Runtime error: a kind plus the errno captured when it happened.
///
/// Constructing one records the errno in the process-wide side table so that
/// [`error_text`] can later compose the full message for a bare code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaspaError {
    kind: ErrorKind,
    errno: i32,
}

impl std::fmt::Display for RaspaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&error_text(self.kind.code()))
    }
}

impl std::error::Error for RaspaError {}

impl RaspaError {
    pub fn new(kind: ErrorKind) -> Self {
        set_errno(kind, 0);
        Self { kind, errno: 0 }
    }

    pub fn with_errno(kind: ErrorKind, errno: i32) -> Self {
        let errno = errno.abs();
        set_errno(kind, errno);
        Self { kind, errno }
    }

    pub fn from_os(kind: ErrorKind, err: &std::io::Error) -> Self {
        Self::with_errno(kind, err.raw_os_error().unwrap_or(0))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn errno(&self) -> i32 {
        self.errno
    }

    /// Negative integer of the public-API convention.
    pub fn code(&self) -> i32 {
        -self.kind.code()
    }
}

impl From<ErrorKind> for RaspaError {
    fn from(kind: ErrorKind) -> Self {
        RaspaError::new(kind)
    }
}

fn errno_table() -> &'static Mutex<HashMap<i32, i32>> {
    static TABLE: std::sync::OnceLock<Mutex<HashMap<i32, i32>>> = std::sync::OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Store the errno observed for a kind. Absolute value is kept.
pub fn set_errno(kind: ErrorKind, errno: i32) {
    errno_table().lock().insert(kind.code(), errno.abs());
}

/// Human-readable text for a (possibly negative) error code.
///
/// When a nonzero errno is on record for the kind, the system description is
/// appended in parentheses; parameter-class kinds additionally carry the
/// driver-not-loaded hint.
pub fn error_text(code: i32) -> String {
    if code == 0 {
        return "Raspa: No error".to_string();
    }

    let Some(kind) = ErrorKind::from_code(code) else {
        return "Raspa: Unknown error".to_string();
    };

    let errno = errno_table().lock().get(&kind.code()).copied().unwrap_or(0);
    let mut text = kind.to_string();
    if errno != 0 {
        text.push_str(" (");
        text.push_str(Errno::from_raw(errno).desc());
        text.push_str("). ");
        if kind.is_param() {
            text.push_str(DRIVER_PARAM_ERROR_INFO);
        }
    }

    text
}
