use log::info;

use crate::codec::Device;
use crate::error::Result;
use crate::transport::Transport;

const DEVICE_ID: u16 = 0x100;
const VIDEO_INPUT_CONTROL: u16 = 0x103;
const AFE_CONTROL_2: u16 = 0x105;
const PIN_CONTROL_2: u16 = 0x115;
const PIN_CONTROL_3: u16 = 0x116;
const VIDEO_MODE_CONTROL_2: u16 = 0x401;
const GENERAL_STATUS_1: u16 = 0x40d;
const GENERAL_STATUS_2: u16 = 0x40e;

/// Audio PLL clock output enable.
const PLL_CLK_OUT_EN: u8 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputSource {
    #[default]
    Composite,
    SVideo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderStatus {
    pub device_id: u16,
    pub status1: u8,
    pub status2: u8,
}

impl<T: Transport> Device<T> {
    pub fn probe_decoder(&mut self) -> Result<DecoderStatus> {
        let id = self.i2c_read(DEVICE_ID, 2)?;
        let status1 = self.i2c_read(GENERAL_STATUS_1, 1)?[0];
        let status2 = self.i2c_read(GENERAL_STATUS_2, 1)?[0];

        let status = DecoderStatus {
            device_id: u16::from_le_bytes([id[0], id[1]]),
            status1,
            status2,
        };
        info!(
            "cx25837 id {:04x}, status {:02x} {:02x}",
            status.device_id, status.status1, status.status2
        );
        Ok(status)
    }

    /// Routes the decoder's analog front end to `input`.
    pub fn select_input(&mut self, input: InputSource) -> Result<()> {
        let svideo = input == InputSource::SVideo;
        info!("input is {:?}", input);

        let routing = if svideo { 1 | (2 << 6) } else { 0x00 };
        self.i2c_write(VIDEO_INPUT_CONTROL, &[routing])?;

        let mode = self.i2c_read(VIDEO_MODE_CONTROL_2, 1)?[0];
        let mode = (mode & !0x06) | if svideo { 1 << 1 } else { 0 };
        self.i2c_write(VIDEO_MODE_CONTROL_2, &[mode])?;

        let afe = self.i2c_read(AFE_CONTROL_2, 1)?[0];
        let afe = (afe & !0x0e) | if svideo { 6 << 1 } else { 0 };
        self.i2c_write(AFE_CONTROL_2, &[afe])
    }

    /// Enables the decoder's video port and audio clock outputs.
    pub fn enable_decoder_outputs(&mut self) -> Result<()> {
        self.i2c_write(PIN_CONTROL_2, &[0x0c])?;
        self.i2c_write(PIN_CONTROL_3, &[PLL_CLK_OUT_EN])?;
        info!("video decoder started");
        Ok(())
    }
}
