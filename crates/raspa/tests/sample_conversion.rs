//! Conversion invariants: round trips, clamping, zero preservation,
//! channel independence and the supported-tuple guard.

use raspa::config::CodecFormat;
use raspa::convert::{
    channel_converter, SUPPORTED_BUFFER_SIZES, SUPPORTED_STRIDES,
};

const INT24_MAX: i32 = 8_388_607;

const NUMERIC_FORMATS: [CodecFormat; 5] = [
    CodecFormat::Int24Lj,
    CodecFormat::Int24I2s,
    CodecFormat::Int24Rj,
    CodecFormat::Int24In32Rj,
    CodecFormat::Int32,
];

const INT24_FORMATS: [CodecFormat; 4] = [
    CodecFormat::Int24Lj,
    CodecFormat::Int24I2s,
    CodecFormat::Int24Rj,
    CodecFormat::Int24In32Rj,
];

fn ramp(frames: usize, channels: usize) -> Vec<f32> {
    let total = frames * channels;
    (0..total)
        .map(|i| -1.0 + (2.0 / total as f32) * i as f32)
        .collect()
}

/// float -> int -> float stays within 1e-6 per sample.
#[test]
fn float_round_trip_error_is_below_1e6() {
    for format in NUMERIC_FORMATS {
        for &frames in &[8usize, 64, 512] {
            let channels = 2usize;
            let stride = channels;
            let converters: Vec<_> = (0..channels)
                .map(|ch| channel_converter(format, frames, stride, ch, ch).unwrap())
                .collect();

            let source = ramp(frames, channels);
            let mut ints = vec![0i32; frames * channels];
            let mut back = vec![0.0f32; frames * channels];
            for conv in &converters {
                conv.to_int(&mut ints, &source);
            }
            for conv in &converters {
                conv.to_float(&mut back, &ints);
            }

            for (i, (a, b)) in source.iter().zip(&back).enumerate() {
                assert!(
                    (a - b).abs() <= 1e-6,
                    "{format:?} frames={frames} sample {i}: {a} vs {b}"
                );
            }
        }
    }
}

/// int -> float -> int is bit-exact for every 24-bit format.
#[test]
fn int_round_trip_is_bit_exact_for_24_bit_formats() {
    for format in INT24_FORMATS {
        let frames = 64usize;
        let channels = 2usize;
        let conv: Vec<_> = (0..channels)
            .map(|ch| channel_converter(format, frames, channels, ch, ch).unwrap())
            .collect();

        // representable codec words come out of a first encoding pass
        let source = ramp(frames, channels);
        let mut first = vec![0i32; frames * channels];
        for c in &conv {
            c.to_int(&mut first, &source);
        }

        let mut floats = vec![0.0f32; frames * channels];
        let mut second = vec![0i32; frames * channels];
        for c in &conv {
            c.to_float(&mut floats, &first);
        }
        for c in &conv {
            c.to_int(&mut second, &floats);
        }

        assert_eq!(first, second, "{format:?}");
    }
}

/// Int32 cannot round-trip bit-exactly through f32; it stays within one
/// float ulp at full scale.
#[test]
fn int32_round_trip_stays_within_mantissa_precision() {
    let frames = 64usize;
    let conv = channel_converter(CodecFormat::Int32, frames, 2, 0, 0).unwrap();

    let source = ramp(frames, 1);
    let mut first = vec![0i32; frames * 2];
    conv.to_int(&mut first, &source);

    let mut floats = vec![0.0f32; frames];
    let mut second = vec![0i32; frames * 2];
    conv.to_float(&mut floats, &first);
    conv.to_int(&mut second, &floats);

    for n in 0..frames {
        let diff = (first[n * 2] as i64 - second[n * 2] as i64).abs();
        assert!(diff <= 0x100, "frame {n}: {} vs {}", first[n * 2], second[n * 2]);
    }
}

/// Out-of-range floats land exactly on the codec's rails.
#[test]
fn clamping_hits_the_codec_rails() {
    let frames = 8usize;
    let over = vec![2.0f32; frames];
    let under = vec![-3.0f32; frames];

    let expected_max = [
        (CodecFormat::Int24Lj, INT24_MAX << 8),
        (CodecFormat::Int24I2s, (INT24_MAX << 7) & 0x7FFF_FF80),
        (CodecFormat::Int24Rj, INT24_MAX),
        (CodecFormat::Int24In32Rj, INT24_MAX),
    ];
    let expected_min = [
        (CodecFormat::Int24Lj, -INT24_MAX << 8),
        (CodecFormat::Int24I2s, (-INT24_MAX << 7) & 0x7FFF_FF80),
        (CodecFormat::Int24Rj, -INT24_MAX & 0x00FF_FFFF),
        (CodecFormat::Int24In32Rj, -INT24_MAX),
    ];

    for (format, want) in expected_max {
        let conv = channel_converter(format, frames, 2, 0, 0).unwrap();
        let mut ints = vec![0i32; frames * 2];
        conv.to_int(&mut ints, &over);
        for n in 0..frames {
            assert_eq!(ints[n * 2], want, "{format:?} positive clamp");
        }
    }

    for (format, want) in expected_min {
        let conv = channel_converter(format, frames, 2, 0, 0).unwrap();
        let mut ints = vec![0i32; frames * 2];
        conv.to_int(&mut ints, &under);
        for n in 0..frames {
            assert_eq!(ints[n * 2], want, "{format:?} negative clamp");
        }
    }

    // Int32: positive rail within 0xFF of 0x7FFFFF00, negative rail exact
    let conv = channel_converter(CodecFormat::Int32, frames, 2, 0, 0).unwrap();
    let mut ints = vec![0i32; frames * 2];
    conv.to_int(&mut ints, &over);
    for n in 0..frames {
        let v = ints[n * 2] as i64;
        assert!(
            (0x7FFF_FF00..=0x7FFF_FFFF).contains(&v),
            "Int32 positive clamp: {v:#x}"
        );
    }
    conv.to_int(&mut ints, &under);
    let negative_rail = ints[0];
    for n in 0..frames {
        assert_eq!(ints[n * 2], negative_rail, "Int32 negative clamp drifted");
    }
    assert!(negative_rail <= -0x7FFF_FF00);
}

/// Zero buffers encode to all-zero words and back, in every format.
#[test]
fn zero_buffers_stay_zero() {
    let frames = 16usize;
    for format in NUMERIC_FORMATS.iter().chain([CodecFormat::Binary].iter()) {
        let conv = channel_converter(*format, frames, 2, 0, 0).unwrap();

        let zeros = vec![0.0f32; frames];
        let mut ints = vec![10i32; frames * 2];
        conv.to_int(&mut ints, &zeros);
        for n in 0..frames {
            assert_eq!(ints[n * 2], 0, "{format:?} float->int zero");
        }

        let int_zeros = vec![0i32; frames * 2];
        let mut floats = vec![0.5f32; frames];
        conv.to_float(&mut floats, &int_zeros);
        for n in 0..frames {
            assert_eq!(floats[n], 0.0, "{format:?} int->float zero");
        }
    }
}

/// Converting one channel never writes outside its stride footprint.
#[test]
fn channel_conversion_respects_its_footprint() {
    let frames = 32usize;
    let stride = 4usize;
    let channel = 1usize;
    let conv = channel_converter(CodecFormat::Int24Lj, frames, stride, channel, channel).unwrap();

    // canary everywhere except channel 1's words
    const CANARY: i32 = 0x7ECA_11AB;
    let mut ints = vec![CANARY; frames * stride];
    let floats = vec![0.5f32; frames * stride];
    conv.to_int(&mut ints, &floats);

    for (i, word) in ints.iter().enumerate() {
        if i % stride == channel {
            assert_ne!(*word, CANARY, "word {i} not written");
        } else {
            assert_eq!(*word, CANARY, "word {i} outside the footprint clobbered");
        }
    }

    // float side: only channel 1's planar run changes
    const FLOAT_CANARY: f32 = -42.5;
    let mut planar = vec![FLOAT_CANARY; frames * stride];
    let src = vec![0i32; frames * stride];
    conv.to_float(&mut planar, &src);

    for (i, sample) in planar.iter().enumerate() {
        if (channel * frames..(channel + 1) * frames).contains(&i) {
            assert_eq!(*sample, 0.0);
        } else {
            assert_eq!(*sample, FLOAT_CANARY, "planar sample {i} clobbered");
        }
    }
}

/// No converter exists outside the supported (buffer size, stride) sets.
#[test]
fn guard_rejects_unsupported_tuples() {
    for frames in [0usize, 7, 9, 24, 96, 1024] {
        assert!(
            channel_converter(CodecFormat::Int24Lj, frames, 2, 0, 0).is_none(),
            "frames={frames} should be rejected"
        );
    }
    for stride in [0usize, 1, 3, 5, 18, 64] {
        assert!(
            channel_converter(CodecFormat::Int24Lj, 64, stride, 0, 0).is_none(),
            "stride={stride} should be rejected"
        );
    }
    for &frames in &SUPPORTED_BUFFER_SIZES {
        for &stride in &SUPPORTED_STRIDES {
            assert!(channel_converter(CodecFormat::Int24Lj, frames, stride, 0, 0).is_some());
        }
    }
}
