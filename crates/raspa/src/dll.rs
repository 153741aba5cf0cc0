//! Delay-locked-loop filter for synchronizing with a companion
//! microcontroller.
//!
//! The companion reports a timing error every period; a second-order IIR
//! low-pass turns that noisy stream into a smooth correction the driver
//! applies to its wake period. Only every sixteenth output is forwarded.

/// Periods the filter needs to reach 99.9% of a step; the user callback is
/// suppressed for this long after start in sync mode.
pub const DELAY_FILTER_SETTLING_PERIODS: u64 = 100;

/// Only one correction in this many ticks is passed on to the driver.
pub const DELAY_FILTER_DOWNSAMPLE_RATE: u32 = 16;

/// Second-order IIR low-pass over the per-period timing error.
#[derive(Debug, Clone)]
pub struct DelayErrorFilter {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
}

impl DelayErrorFilter {
    /// `t60_in_periods` is the settling time constant expressed in periods.
    pub fn new(t60_in_periods: u32) -> Self {
        // digital frequency, i.e. one over tau
        let omega = 1000.0f32.ln() / t60_in_periods as f32;
        let alpha = omega.sin();
        let comega = omega.cos();

        let a0 = 1.0 + alpha;
        Self {
            b0: (0.5 * (1.0 - comega)) / a0,
            b1: (1.0 - comega) / a0,
            b2: (0.5 * (1.0 - comega)) / a0,
            a1: (-2.0 * comega) / a0,
            a2: (1.0 - alpha) / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    /// One filter update; input and output are nanoseconds.
    pub fn tick(&mut self, error_ns: i32) -> i32 {
        let x = error_ns as f32;
        let y = self.b0 * x + self.z1;

        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;

        y.round() as i32
    }
}

/// Downsampling wrapper the RT loop drives once per period.
///
/// The inner filter ticks every call; the correction is handed out on every
/// sixteenth call and swallowed (returned as 0) in between.
#[derive(Debug, Clone)]
pub struct CorrectionDownsampler {
    filter: DelayErrorFilter,
    count: u32,
}

impl CorrectionDownsampler {
    pub fn new(t60_in_periods: u32) -> Self {
        Self {
            filter: DelayErrorFilter::new(t60_in_periods),
            count: 0,
        }
    }

    pub fn process(&mut self, error_ns: i32) -> i32 {
        let correction = self.filter.tick(error_ns);

        self.count += 1;
        if self.count < DELAY_FILTER_DOWNSAMPLE_RATE {
            return 0;
        }

        self.count = 0;
        correction
    }
}
