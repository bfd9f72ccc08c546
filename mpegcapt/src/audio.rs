//! Audio clock setup of the CX25837 video decoder.
//!
//! The decoder derives its audio master clock from an auxiliary PLL fed by
//! the 28.636 MHz crystal. Each supported sample rate has a fixed set of
//! register values; there is no computed fallback.

use log::debug;

use crate::codec::Device;
use crate::error::{Error, Result};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleRate {
    Hz32000,
    Hz44100,
    Hz48000,
}

impl SampleRate {
    pub fn hz(self) -> u32 {
        match self {
            SampleRate::Hz32000 => 32000,
            SampleRate::Hz44100 => 44100,
            SampleRate::Hz48000 => 48000,
        }
    }

    /// Sample-rate field of the encoder's audio properties word.
    pub fn encoder_bits(self) -> u32 {
        match self {
            SampleRate::Hz44100 => 0,
            SampleRate::Hz48000 => 1,
            SampleRate::Hz32000 => 2,
        }
    }

    /// Decoder register writes that put the audio PLL on this rate.
    pub fn pll_table(self) -> &'static [(u16, &'static [u8])] {
        match self {
            SampleRate::Hz32000 => PLL_32000,
            SampleRate::Hz44100 => PLL_44100,
            SampleRate::Hz48000 => PLL_48000,
        }
    }
}

impl TryFrom<u32> for SampleRate {
    type Error = Error;

    fn try_from(hz: u32) -> Result<Self> {
        match hz {
            32000 => Ok(SampleRate::Hz32000),
            44100 => Ok(SampleRate::Hz44100),
            48000 => Ok(SampleRate::Hz48000),
            other => Err(Error::Config(format!("unsupported sample rate {} Hz", other))),
        }
    }
}

// VID_PLL/AUX_PLL integer (0x108), AUX_PLL fraction (0x110), sample rate
// converter ratios (0x900, 0x904, 0x90c), audio master clock divider (0x127).
// Multi-byte registers are little-endian.
const PLL_32000: &[(u16, &[u8])] = &[
    (0x108, &[0x0f, 0x04, 0x06, 0x10]),
    (0x110, &[0xee, 0x39, 0xbb, 0x01]),
    (0x900, &[0x7f, 0xf7, 0x01, 0x08]),
    (0x904, &[0x7f, 0xf7, 0x01, 0x08]),
    (0x90c, &[0x7f, 0xf7, 0x01, 0x08]),
    (0x127, &[0x54]),
];

const PLL_44100: &[(u16, &[u8])] = &[
    (0x108, &[0x0f, 0x04, 0x09, 0x10]),
    (0x110, &[0xd6, 0x6b, 0xec, 0x00]),
    (0x900, &[0x59, 0x6d, 0x01, 0x08]),
    (0x904, &[0x59, 0x6d, 0x01, 0x08]),
    (0x90c, &[0x59, 0x6d, 0x01, 0x08]),
    (0x127, &[0x50]),
];

const PLL_48000: &[(u16, &[u8])] = &[
    (0x108, &[0x0f, 0x04, 0x0a, 0x10]),
    (0x110, &[0xe5, 0xd6, 0x98, 0x00]),
    (0x900, &[0xaa, 0x4f, 0x01, 0x08]),
    (0x904, &[0xaa, 0x4f, 0x01, 0x08]),
    (0x90c, &[0xaa, 0x4f, 0x01, 0x08]),
    (0x127, &[0x50]),
];

impl<T: Transport> Device<T> {
    pub fn set_audio_clock(&mut self, rate: SampleRate) -> Result<()> {
        for (reg, value) in rate.pll_table() {
            self.i2c_write(*reg, value)?;
        }
        debug!("decoder audio clock set to {} Hz", rate.hz());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    #[test]
    fn only_three_rates_are_known() {
        assert_eq!(SampleRate::try_from(44100).unwrap(), SampleRate::Hz44100);
        assert_eq!(SampleRate::try_from(48000).unwrap().hz(), 48000);
        assert!(matches!(SampleRate::try_from(22050), Err(Error::Config(_))));
        assert!(matches!(SampleRate::try_from(0), Err(Error::Config(_))));
    }

    #[test]
    fn tables_cover_the_same_registers() {
        let regs = |rate: SampleRate| -> Vec<u16> {
            rate.pll_table().iter().map(|(reg, _)| *reg).collect()
        };
        assert_eq!(regs(SampleRate::Hz32000), regs(SampleRate::Hz44100));
        assert_eq!(regs(SampleRate::Hz32000), regs(SampleRate::Hz48000));
    }

    #[test]
    fn audio_clock_programs_decoder() {
        let mut device = Device::new(MockDevice::new());
        device.set_audio_clock(SampleRate::Hz48000).unwrap();

        let decoder = &device.transport().decoder;
        assert_eq!(decoder[&0x108], 0x0f);
        assert_eq!(decoder[&0x10a], 0x0a);
        assert_eq!(decoder[&0x127], 0x50);
        assert_eq!(device.transport().writes.len(), 6);
    }
}
