//! Typed reader for the driver's parameter surface.
//!
//! The audio driver exposes its configuration as a directory of text files,
//! one small decimal integer each. The reader is pointed at the production
//! sysfs path by default; tests point it at a temp directory.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, RaspaError};

/// Parameter directory exposed by the kernel module.
pub const MODULE_PARAMETERS_PATH: &str = "/sys/module/audio_rtdm/parameters";

/// Driver interface version this library is built against. The major must
/// match exactly, the minor must be at least this value.
pub const REQUIRED_DRIVER_VERSION_MAJ: i32 = 0;
pub const REQUIRED_DRIVER_VERSION_MIN: i32 = 2;

const PARAM_VALUE_MAX_LEN: usize = 25;

/// How a 32-bit word in the codec buffer carries one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CodecFormat {
    /// 24 significant bits, left justified.
    Int24Lj = 1,
    /// 24 significant bits in I2S framing, sign bit not in bit 31.
    Int24I2s = 2,
    /// 24 significant bits, right justified, no sign extension.
    Int24Rj = 3,
    /// 24 significant bits, right justified and sign extended to 32.
    Int24In32Rj = 4,
    /// Full 32-bit samples.
    Int32 = 5,
    /// Bit-transparent payload, no numeric conversion.
    Binary = 6,
}

impl CodecFormat {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(CodecFormat::Int24Lj),
            2 => Some(CodecFormat::Int24I2s),
            3 => Some(CodecFormat::Int24Rj),
            4 => Some(CodecFormat::Int24In32Rj),
            5 => Some(CodecFormat::Int32),
            6 => Some(CodecFormat::Binary),
            _ => None,
        }
    }
}

/// Shape of the board the driver runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PlatformType {
    /// Driver talks to the codec directly over DMA buffers.
    Native = 0,
    /// Companion microcontroller, driver wake period steered by a DLL.
    Sync = 1,
    /// Companion microcontroller running on its own clock.
    Async = 2,
}

impl PlatformType {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(PlatformType::Native),
            1 => Some(PlatformType::Sync),
            2 => Some(PlatformType::Async),
            _ => None,
        }
    }
}

/// Placement of one channel inside the hardware buffer, in 32-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub start_offset: usize,
    pub stride: usize,
}

/// Interleaved layout: channel k starts at word k, one frame per stride.
pub fn interleaved_layout(num_channels: usize) -> Vec<ChannelInfo> {
    (0..num_channels)
        .map(|ch| ChannelInfo {
            start_offset: ch,
            stride: num_channels,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    base: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::new(MODULE_PARAMETERS_PATH)
    }
}

impl DriverConfig {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    /// Read one named parameter: open, read at most 25 bytes, parse decimal.
    pub fn read_param(&self, name: &str, kind: ErrorKind) -> Result<i32, RaspaError> {
        let path = self.base.join(name);
        let mut file = File::open(&path).map_err(|e| RaspaError::from_os(kind, &e))?;

        let mut buf = [0u8; PARAM_VALUE_MAX_LEN];
        let n = file
            .read(&mut buf)
            .map_err(|e| RaspaError::from_os(kind, &e))?;

        let text = std::str::from_utf8(&buf[..n])
            .map_err(|_| RaspaError::with_errno(kind, libc::EINVAL))?;
        text.trim()
            .parse::<i32>()
            .map_err(|_| RaspaError::with_errno(kind, libc::EINVAL))
    }

    /// Exact major match, minor at least the required one.
    pub fn check_version(&self) -> Result<(), RaspaError> {
        let maj = self.read_param("audio_ver_maj", ErrorKind::ParamVersion)?;
        let min = self.read_param("audio_ver_min", ErrorKind::ParamVersion)?;

        if maj != REQUIRED_DRIVER_VERSION_MAJ || min < REQUIRED_DRIVER_VERSION_MIN {
            return Err(RaspaError::new(ErrorKind::VersionMismatch));
        }
        Ok(())
    }

    pub fn sample_rate(&self) -> Result<i32, RaspaError> {
        self.read_param("audio_sampling_rate", ErrorKind::ParamSampleRate)
    }

    pub fn num_input_channels(&self) -> Result<i32, RaspaError> {
        self.read_param("audio_input_channels", ErrorKind::ParamInputChans)
    }

    pub fn num_output_channels(&self) -> Result<i32, RaspaError> {
        self.read_param("audio_output_channels", ErrorKind::ParamOutputChans)
    }

    pub fn buffer_size(&self) -> Result<i32, RaspaError> {
        self.read_param("audio_buffer_size", ErrorKind::ParamBufferSize)
    }

    pub fn codec_format(&self) -> Result<CodecFormat, RaspaError> {
        let raw = self.read_param("audio_format", ErrorKind::ParamCodecFormat)?;
        CodecFormat::from_raw(raw)
            .ok_or_else(|| RaspaError::with_errno(ErrorKind::CodecFormat, raw))
    }

    pub fn platform_type(&self) -> Result<PlatformType, RaspaError> {
        let raw = self.read_param("platform_type", ErrorKind::ParamPlatformType)?;
        PlatformType::from_raw(raw)
            .ok_or_else(|| RaspaError::with_errno(ErrorKind::PlatformType, raw))
    }

    pub fn usb_audio_type(&self) -> Result<i32, RaspaError> {
        self.read_param("usb_audio_type", ErrorKind::ParamUsbAudioType)
    }

    pub fn irq_affinity(&self) -> Result<i32, RaspaError> {
        self.read_param("audio_irq_affinity", ErrorKind::ParamIrqAffinity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn surface(params: &[(&str, &str)]) -> (tempfile::TempDir, DriverConfig) {
        let dir = tempfile::tempdir().unwrap();
        for (name, value) in params {
            fs::write(dir.path().join(name), value).unwrap();
        }
        let cfg = DriverConfig::new(dir.path());
        (dir, cfg)
    }

    #[test]
    fn reads_decimal_parameters() {
        let (_dir, cfg) = surface(&[
            ("audio_sampling_rate", "48000\n"),
            ("audio_input_channels", "2"),
            ("audio_output_channels", "8"),
        ]);
        assert_eq!(cfg.sample_rate().unwrap(), 48_000);
        assert_eq!(cfg.num_input_channels().unwrap(), 2);
        assert_eq!(cfg.num_output_channels().unwrap(), 8);
    }

    #[test]
    fn missing_parameter_maps_to_its_kind() {
        let (_dir, cfg) = surface(&[]);
        let err = cfg.sample_rate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParamSampleRate);
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn garbage_parameter_is_rejected() {
        let (_dir, cfg) = surface(&[("audio_buffer_size", "not a number")]);
        let err = cfg.buffer_size().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParamBufferSize);
    }

    #[test]
    fn version_check_wants_exact_major_and_min_minor() {
        let (_dir, cfg) = surface(&[("audio_ver_maj", "0"), ("audio_ver_min", "3")]);
        cfg.check_version().unwrap();

        let (_dir, cfg) = surface(&[("audio_ver_maj", "1"), ("audio_ver_min", "2")]);
        assert_eq!(
            cfg.check_version().unwrap_err().kind(),
            ErrorKind::VersionMismatch
        );

        let (_dir, cfg) = surface(&[("audio_ver_maj", "0"), ("audio_ver_min", "1")]);
        assert_eq!(
            cfg.check_version().unwrap_err().kind(),
            ErrorKind::VersionMismatch
        );
    }

    #[test]
    fn codec_and_platform_are_validated() {
        let (_dir, cfg) = surface(&[("audio_format", "3"), ("platform_type", "2")]);
        assert_eq!(cfg.codec_format().unwrap(), CodecFormat::Int24Rj);
        assert_eq!(cfg.platform_type().unwrap(), PlatformType::Async);

        let (_dir, cfg) = surface(&[("audio_format", "7"), ("platform_type", "9")]);
        assert_eq!(
            cfg.codec_format().unwrap_err().kind(),
            ErrorKind::CodecFormat
        );
        assert_eq!(
            cfg.platform_type().unwrap_err().kind(),
            ErrorKind::PlatformType
        );
    }

    #[test]
    fn interleaved_layout_strides_by_channel_count() {
        let layout = interleaved_layout(4);
        assert_eq!(layout.len(), 4);
        for (ch, info) in layout.iter().enumerate() {
            assert_eq!(info.start_offset, ch);
            assert_eq!(info.stride, 4);
        }
    }
}
