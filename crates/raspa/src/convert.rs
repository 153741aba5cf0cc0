//! Codec-format-aware sample conversion between the driver's packed integer
//! buffers and the planar float buffers handed to the user callback.
//!
//! One converter is materialized per channel at open time. Buffer size,
//! hardware stride and codec format are baked in as compile-time constants so
//! the inner loops have fixed bounds and branch-free format arithmetic; only
//! the software channel id and the hardware start offset stay runtime values.
//! A runtime-generic converter exists for measurement and is never selected
//! by [`channel_converter`].

use std::marker::PhantomData;

use crate::config::{ChannelInfo, CodecFormat};
use crate::error::{ErrorKind, RaspaError};

/// Buffer sizes (frames per period) with a specialized inner loop.
pub const SUPPORTED_BUFFER_SIZES: [usize; 9] = [8, 16, 32, 48, 64, 128, 192, 256, 512];

/// Channel strides, in words, with a specialized inner loop.
pub const SUPPORTED_STRIDES: [usize; 10] = [2, 4, 6, 8, 10, 12, 14, 16, 24, 32];

const FLOAT_TO_INT24_SCALE: f32 = 8_388_607.0; // 2^23 - 1
const INT24_TO_FLOAT_SCALE: f32 = 1.0 / 8_388_607.0;
const FLOAT_TO_INT32_SCALE: f32 = 2_147_483_647.0; // 2^31 - 1
const INT32_TO_FLOAT_SCALE: f32 = 1.0 / 2_147_483_647.0;

/// Converts exactly one channel between the codec buffer and the planar
/// float image.
///
/// `to_float` reads `src[start + n * stride]` and writes
/// `dst[channel * frames + n]`; `to_int` is the mirror image with clamping.
pub trait SampleConverter: Send {
    fn to_float(&self, dst: &mut [f32], src: &[i32]);
    fn to_int(&self, dst: &mut [i32], src: &[f32]);
}

/// Per-format word arithmetic. `raw` is the 32-bit word as it sits in the
/// codec buffer, the float side is normalized to [-1, 1].
trait FormatOps: Send + Sync + 'static {
    fn raw_to_float(raw: i32) -> f32;
    fn float_to_raw(x: f32) -> i32;
}

struct Int24LjFmt;

impl FormatOps for Int24LjFmt {
    #[inline(always)]
    fn raw_to_float(raw: i32) -> f32 {
        (raw >> 8) as f32 * INT24_TO_FLOAT_SCALE
    }

    #[inline(always)]
    fn float_to_raw(x: f32) -> i32 {
        let s = (x.clamp(-1.0, 1.0) * FLOAT_TO_INT24_SCALE) as i32;
        s << 8
    }
}

struct Int24I2sFmt;

impl FormatOps for Int24I2sFmt {
    #[inline(always)]
    fn raw_to_float(raw: i32) -> f32 {
        // Sign bit is not in bit 31; shift it there first, then extend.
        ((raw << 1) >> 8) as f32 * INT24_TO_FLOAT_SCALE
    }

    #[inline(always)]
    fn float_to_raw(x: f32) -> i32 {
        let s = (x.clamp(-1.0, 1.0) * FLOAT_TO_INT24_SCALE) as i32;
        (s << 7) & 0x7FFF_FF80
    }
}

struct Int24RjFmt;

impl FormatOps for Int24RjFmt {
    #[inline(always)]
    fn raw_to_float(raw: i32) -> f32 {
        // Top byte carries no sign info; two shifts extend it.
        ((raw << 8) >> 8) as f32 * INT24_TO_FLOAT_SCALE
    }

    #[inline(always)]
    fn float_to_raw(x: f32) -> i32 {
        let s = (x.clamp(-1.0, 1.0) * FLOAT_TO_INT24_SCALE) as i32;
        s & 0x00FF_FFFF
    }
}

struct Int24In32RjFmt;

impl FormatOps for Int24In32RjFmt {
    #[inline(always)]
    fn raw_to_float(raw: i32) -> f32 {
        raw as f32 * INT24_TO_FLOAT_SCALE
    }

    #[inline(always)]
    fn float_to_raw(x: f32) -> i32 {
        (x.clamp(-1.0, 1.0) * FLOAT_TO_INT24_SCALE) as i32
    }
}

struct Int32Fmt;

impl FormatOps for Int32Fmt {
    #[inline(always)]
    fn raw_to_float(raw: i32) -> f32 {
        raw as f32 * INT32_TO_FLOAT_SCALE
    }

    #[inline(always)]
    fn float_to_raw(x: f32) -> i32 {
        (x.clamp(-1.0, 1.0) * FLOAT_TO_INT32_SCALE) as i32
    }
}

struct BinaryFmt;

impl FormatOps for BinaryFmt {
    #[inline(always)]
    fn raw_to_float(raw: i32) -> f32 {
        f32::from_bits(raw as u32)
    }

    #[inline(always)]
    fn float_to_raw(x: f32) -> i32 {
        x.to_bits() as i32
    }
}

/// Monomorphized per-channel converter; `FRAMES` and `STRIDE` are fixed at
/// construction through the dispatch table below.
struct Specialized<F: FormatOps, const FRAMES: usize, const STRIDE: usize> {
    /// `sw_channel_id * FRAMES`, the channel's run in the planar image.
    channel_base: usize,
    /// First word of the channel inside the codec buffer.
    start_offset: usize,
    _format: PhantomData<F>,
}

impl<F: FormatOps, const FRAMES: usize, const STRIDE: usize> Specialized<F, FRAMES, STRIDE> {
    fn new(sw_channel_id: usize, start_offset: usize) -> Self {
        Self {
            channel_base: sw_channel_id * FRAMES,
            start_offset,
            _format: PhantomData,
        }
    }
}

impl<F: FormatOps, const FRAMES: usize, const STRIDE: usize> SampleConverter
    for Specialized<F, FRAMES, STRIDE>
{
    fn to_float(&self, dst: &mut [f32], src: &[i32]) {
        let dst = &mut dst[self.channel_base..self.channel_base + FRAMES];
        for (n, out) in dst.iter_mut().enumerate() {
            *out = F::raw_to_float(src[self.start_offset + n * STRIDE]);
        }
    }

    fn to_int(&self, dst: &mut [i32], src: &[f32]) {
        let src = &src[self.channel_base..self.channel_base + FRAMES];
        for (n, x) in src.iter().enumerate() {
            dst[self.start_offset + n * STRIDE] = F::float_to_raw(*x);
        }
    }
}

fn boxed<F: FormatOps, const FRAMES: usize, const STRIDE: usize>(
    sw_channel_id: usize,
    start_offset: usize,
) -> Box<dyn SampleConverter> {
    Box::new(Specialized::<F, FRAMES, STRIDE>::new(
        sw_channel_id,
        start_offset,
    ))
}

macro_rules! select_stride {
    ($fmt:ty, $frames:literal, $stride:expr, $ch:expr, $off:expr) => {
        match $stride {
            2 => boxed::<$fmt, $frames, 2>($ch, $off),
            4 => boxed::<$fmt, $frames, 4>($ch, $off),
            6 => boxed::<$fmt, $frames, 6>($ch, $off),
            8 => boxed::<$fmt, $frames, 8>($ch, $off),
            10 => boxed::<$fmt, $frames, 10>($ch, $off),
            12 => boxed::<$fmt, $frames, 12>($ch, $off),
            14 => boxed::<$fmt, $frames, 14>($ch, $off),
            16 => boxed::<$fmt, $frames, 16>($ch, $off),
            24 => boxed::<$fmt, $frames, 24>($ch, $off),
            32 => boxed::<$fmt, $frames, 32>($ch, $off),
            _ => return None,
        }
    };
}

macro_rules! select_frames {
    ($fmt:ty, $frames:expr, $stride:expr, $ch:expr, $off:expr) => {
        match $frames {
            8 => select_stride!($fmt, 8, $stride, $ch, $off),
            16 => select_stride!($fmt, 16, $stride, $ch, $off),
            32 => select_stride!($fmt, 32, $stride, $ch, $off),
            48 => select_stride!($fmt, 48, $stride, $ch, $off),
            64 => select_stride!($fmt, 64, $stride, $ch, $off),
            128 => select_stride!($fmt, 128, $stride, $ch, $off),
            192 => select_stride!($fmt, 192, $stride, $ch, $off),
            256 => select_stride!($fmt, 256, $stride, $ch, $off),
            512 => select_stride!($fmt, 512, $stride, $ch, $off),
            _ => return None,
        }
    };
}

/// Materialize the specialized converter for one channel, or `None` when the
/// (buffer size, stride) tuple has no specialization.
pub fn channel_converter(
    format: CodecFormat,
    frames_per_buffer: usize,
    stride: usize,
    sw_channel_id: usize,
    start_offset: usize,
) -> Option<Box<dyn SampleConverter>> {
    let converter = match format {
        CodecFormat::Int24Lj => {
            select_frames!(Int24LjFmt, frames_per_buffer, stride, sw_channel_id, start_offset)
        }
        CodecFormat::Int24I2s => {
            select_frames!(Int24I2sFmt, frames_per_buffer, stride, sw_channel_id, start_offset)
        }
        CodecFormat::Int24Rj => {
            select_frames!(Int24RjFmt, frames_per_buffer, stride, sw_channel_id, start_offset)
        }
        CodecFormat::Int24In32Rj => {
            select_frames!(Int24In32RjFmt, frames_per_buffer, stride, sw_channel_id, start_offset)
        }
        CodecFormat::Int32 => {
            select_frames!(Int32Fmt, frames_per_buffer, stride, sw_channel_id, start_offset)
        }
        CodecFormat::Binary => {
            select_frames!(BinaryFmt, frames_per_buffer, stride, sw_channel_id, start_offset)
        }
    };
    Some(converter)
}

/// One converter per channel from the driver-reported layout. Fails as
/// unsupported-buffer-size when any tuple has no specialization.
pub fn build_channel_converters(
    format: CodecFormat,
    frames_per_buffer: usize,
    layout: &[ChannelInfo],
) -> Result<Vec<Box<dyn SampleConverter>>, RaspaError> {
    layout
        .iter()
        .enumerate()
        .map(|(ch, info)| {
            channel_converter(format, frames_per_buffer, info.stride, ch, info.start_offset)
                .ok_or_else(|| RaspaError::new(ErrorKind::BufferSizeUnsupported))
        })
        .collect()
}

/// Runtime-generic converter, kept for micro-benchmarks. Production code
/// always goes through [`channel_converter`].
pub struct GenericConverter {
    raw_to_float: fn(i32) -> f32,
    float_to_raw: fn(f32) -> i32,
    frames: usize,
    stride: usize,
    channel_base: usize,
    start_offset: usize,
}

impl GenericConverter {
    pub fn new(
        format: CodecFormat,
        frames_per_buffer: usize,
        stride: usize,
        sw_channel_id: usize,
        start_offset: usize,
    ) -> Self {
        let (raw_to_float, float_to_raw): (fn(i32) -> f32, fn(f32) -> i32) = match format {
            CodecFormat::Int24Lj => (Int24LjFmt::raw_to_float, Int24LjFmt::float_to_raw),
            CodecFormat::Int24I2s => (Int24I2sFmt::raw_to_float, Int24I2sFmt::float_to_raw),
            CodecFormat::Int24Rj => (Int24RjFmt::raw_to_float, Int24RjFmt::float_to_raw),
            CodecFormat::Int24In32Rj => {
                (Int24In32RjFmt::raw_to_float, Int24In32RjFmt::float_to_raw)
            }
            CodecFormat::Int32 => (Int32Fmt::raw_to_float, Int32Fmt::float_to_raw),
            CodecFormat::Binary => (BinaryFmt::raw_to_float, BinaryFmt::float_to_raw),
        };
        Self {
            raw_to_float,
            float_to_raw,
            frames: frames_per_buffer,
            stride,
            channel_base: sw_channel_id * frames_per_buffer,
            start_offset,
        }
    }
}

impl SampleConverter for GenericConverter {
    fn to_float(&self, dst: &mut [f32], src: &[i32]) {
        for n in 0..self.frames {
            dst[self.channel_base + n] = (self.raw_to_float)(src[self.start_offset + n * self.stride]);
        }
    }

    fn to_int(&self, dst: &mut [i32], src: &[f32]) {
        for n in 0..self.frames {
            dst[self.start_offset + n * self.stride] = (self.float_to_raw)(src[self.channel_base + n]);
        }
    }
}
