//! Bit-level H.264 parsing
//!
//! This module provides everything the recorder needs to understand the
//! published bitstream:
//! - Exp-Golomb bit reading
//! - SPS geometry/profile parsing
//! - Annex-B splitting and AVCC framing

pub mod bits;
pub mod nal;
pub mod sps;

pub use bits::BitReader;
pub use nal::NalUnitType;
pub use sps::SpsInfo;
