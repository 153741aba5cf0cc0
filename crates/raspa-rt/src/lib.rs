//! Real-time primitives shared across the raspa runtime.

pub mod spsc;
pub mod thread;

pub use spsc::{RingError, SpscRing};
