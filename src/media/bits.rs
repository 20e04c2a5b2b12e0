//! Exp-Golomb bit reader
//!
//! H.264 parameter sets are bit-packed with variable-length Exp-Golomb
//! integers. Malformed input is expected (truncated SPS, bad parameter
//! sets from remote encoders), so every read returns a `Result` instead of
//! panicking.

use crate::error::{MediaError, Result};

/// MSB-first bit reader over a byte slice
pub struct BitReader<'a> {
    data: &'a [u8],
    idx: usize,
    mask: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            idx: 0,
            mask: 0x80,
        }
    }

    /// Read a single bit
    pub fn read_bit(&mut self) -> Result<u8, MediaError> {
        if self.idx >= self.data.len() {
            return Err(MediaError::BitReaderOverflow);
        }
        let value = u8::from(self.data[self.idx] & self.mask != 0);
        self.mask >>= 1;
        if self.mask == 0 {
            self.mask = 0x80;
            self.idx += 1;
        }
        Ok(value)
    }

    /// Read `n` bits as an unsigned integer (MSB first)
    pub fn read_bits(&mut self, n: usize) -> Result<u32, MediaError> {
        let mut value = 0u32;
        for _ in 0..n {
            value = (value << 1) | u32::from(self.read_bit()?);
        }
        Ok(value)
    }

    /// Read an unsigned Exp-Golomb value (`ue(v)`)
    ///
    /// Values needing more than 31 leading zeros cannot fit a `u32` and are
    /// rejected rather than wrapping the shift below.
    pub fn read_ue(&mut self) -> Result<u32, MediaError> {
        let mut zeros = 0usize;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return Err(MediaError::BitReaderOverflow);
            }
        }
        if zeros == 0 {
            return Ok(0);
        }
        let suffix = self.read_bits(zeros)?;
        Ok((1u32 << zeros) - 1 + suffix)
    }

    /// Read a signed Exp-Golomb value (`se(v)`)
    ///
    /// Mapped as `k = (ue + 1) / 2`, negated when `ue` is even.
    pub fn read_se(&mut self) -> Result<i32, MediaError> {
        let ue = self.read_ue()?;
        let k = ((ue + 1) / 2) as i32;
        if ue % 2 == 0 {
            Ok(-k)
        } else {
            Ok(k)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_bit() {
        let mut br = BitReader::new(&[0b1010_0000]);
        assert_eq!(br.read_bit().unwrap(), 1);
        assert_eq!(br.read_bit().unwrap(), 0);
        assert_eq!(br.read_bit().unwrap(), 1);
        assert_eq!(br.read_bit().unwrap(), 0);
    }

    #[test]
    fn test_read_bits_across_bytes() {
        let mut br = BitReader::new(&[0xAB, 0xCD]);
        assert_eq!(br.read_bits(12).unwrap(), 0xABC);
        assert_eq!(br.read_bits(4).unwrap(), 0xD);
    }

    #[test]
    fn test_read_ue() {
        // "1" -> 0, "010" -> 1, "011" -> 2, "00100" -> 3
        let mut br = BitReader::new(&[0b1_010_011_0, 0b0100_0000]);
        assert_eq!(br.read_ue().unwrap(), 0);
        assert_eq!(br.read_ue().unwrap(), 1);
        assert_eq!(br.read_ue().unwrap(), 2);
        assert_eq!(br.read_ue().unwrap(), 3);
    }

    #[test]
    fn test_read_se() {
        // ue 0 -> 0, ue 1 -> +1, ue 2 -> -1, ue 3 -> +2, ue 4 -> -2
        let bits = [
            0b1_010_011_0, // 0, 1, 2 then start of "00100"
            0b0100_0010,   // rest of 3, then "00101" start
            0b1000_0000,
        ];
        let mut br = BitReader::new(&bits);
        assert_eq!(br.read_se().unwrap(), 0);
        assert_eq!(br.read_se().unwrap(), 1);
        assert_eq!(br.read_se().unwrap(), -1);
        assert_eq!(br.read_se().unwrap(), 2);
        assert_eq!(br.read_se().unwrap(), -2);
    }

    #[test]
    fn test_overflow() {
        let mut br = BitReader::new(&[0xFF]);
        assert_eq!(br.read_bits(8).unwrap(), 0xFF);
        assert_eq!(br.read_bit(), Err(MediaError::BitReaderOverflow));
    }

    #[test]
    fn test_ue_overflow_on_truncated_input() {
        // All zeros: never finds the terminating one bit
        let mut br = BitReader::new(&[0x00]);
        assert_eq!(br.read_ue(), Err(MediaError::BitReaderOverflow));
    }

    #[test]
    fn test_ue_rejects_oversized_value() {
        // 32 leading zeros encode a 33-bit value even though the
        // terminating one bit and suffix are all present
        let mut br = BitReader::new(&[0x00, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(br.read_ue(), Err(MediaError::BitReaderOverflow));
    }

    #[test]
    fn test_ue_widest_accepted_value() {
        // 31 zeros, the one bit, then a 31-bit suffix of zeros
        let mut data = [0u8; 9];
        data[3] = 0x01; // bit 32 terminates the prefix
        let mut br = BitReader::new(&data);
        assert_eq!(br.read_ue().unwrap(), (1u32 << 31) - 1);
    }
}
