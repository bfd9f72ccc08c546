//! Power-on sequence taking the board from reset to a running encoder.

use std::io::Read;

use log::info;

use crate::codec::{Device, Gpio};
use crate::decoder::{DecoderStatus, InputSource};
use crate::encoder::EncoderSettings;
use crate::error::Result;
use crate::transport::Transport;

/// Single-byte vendor commands understood by the USB bridge.
pub mod vendor {
    pub const ENCODER_RESUME: u8 = 0xde;
    pub const QUERY_SPEED: u8 = 0x0b;
    pub const QUERY_EEPROM: u8 = 0xeb;
    pub const PREPARE_GPIO: u8 = 0xdd;
    pub const PREPARE_DOWNLOAD: u8 = 0x52;
    pub const FIRMWARE_MODE: u8 = 0x06;
    pub const STREAM_START: u8 = 0x36;
}

/// Speed query answer for a high speed link.
const HIGH_SPEED: u8 = 0x80;

const ENCODER_INTERRUPT_MASK: u16 = 0x0048;
const ENCODER_RESET_1: u16 = 0x9054;
const ENCODER_RESET_2: u16 = 0x9058;

/// Register values written after the bridge comes out of reset.
const INIT_REGISTERS: &[(u16, u32)] = &[
    (0x07f8, 0x8000_0800),
    (0x07fc, 0x0000_001a),
    (0x0700, 0x0000_0000),
    (0xaa00, 0x0000_0000),
    (0xaa04, 0x0005_7810),
    (0xaa10, 0x0014_8500),
    (0xaa18, 0x0084_0000),
];

/// Register windows covered by [`Device::dump_registers`], as
/// (start, last offset).
const DUMP_WINDOWS: &[(u16, u16)] = &[
    (0x0000, 0xfc),
    (0x0700, 0xfc),
    (0x9000, 0x54),
    (0xa000, 0x6c),
    (0xaa00, 0x20),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub high_speed: bool,
    /// I2C address of the configuration EEPROM, if fitted.
    pub eeprom: Option<u8>,
    pub decoder: DecoderStatus,
}

impl<T: Transport> Device<T> {
    pub fn query_device(&mut self) -> Result<(bool, Option<u8>)> {
        self.vendor_command(&[vendor::ENCODER_RESUME])?;

        let high_speed = self.vendor_query(&[vendor::QUERY_SPEED])? == HIGH_SPEED;
        if high_speed {
            info!("device has high speed mode");
        }

        let eeprom = match self.vendor_query(&[vendor::QUERY_EEPROM])? {
            0 => {
                info!("device has no eeprom");
                None
            }
            addr => {
                info!("device eeprom address is {:x}", addr);
                Some(addr)
            }
        };

        Ok((high_speed, eeprom))
    }

    fn set_firmware_mode(&mut self) -> Result<()> {
        self.vendor_command(&[vendor::FIRMWARE_MODE, 0])
    }

    /// Resets the bridge side of the board and leaves the encoder ready to
    /// receive its firmware.
    pub fn prepare_encoder(&mut self) -> Result<()> {
        self.write_register(ENCODER_INTERRUPT_MASK, 0xffff_ffff)?;
        self.gpio_configure(Gpio::Direction, 0xffff_ffff, 0x0000_0088)?;
        self.gpio_configure(Gpio::Output, 0xffff_ffff, 0x0000_0008)?;

        self.vendor_command(&[vendor::PREPARE_GPIO])?;

        self.write_register(0xa064, 0)?;
        self.gpio_configure(Gpio::Direction, 0xffff_ffff, 0x0000_0408)?;
        self.gpio_configure(Gpio::Output, 0xffff_ffff, 0x0000_0008)?;
        self.write_register(ENCODER_RESET_2, 0xffff_ffed)?;
        self.write_register(ENCODER_RESET_1, 0xffff_fffd)?;
        for (addr, value) in INIT_REGISTERS {
            self.write_register(*addr, *value)?;
        }

        self.vendor_command(&[vendor::PREPARE_DOWNLOAD])?;
        self.set_firmware_mode()
    }

    /// Releases the encoder from reset once its firmware is in place.
    pub fn release_encoder(&mut self) -> Result<()> {
        self.write_register(ENCODER_RESET_1, 0xffff_ffff)?;
        self.write_register(ENCODER_RESET_2, 0xffff_ffe8)?;
        self.set_firmware_mode()
    }

    /// Full bring-up: board queries, decoder probe, firmware download and
    /// encoder configuration, finishing with the decoder routed to `input`.
    pub fn bring_up<R: Read>(
        &mut self,
        firmware: R,
        settings: &EncoderSettings,
        input: InputSource,
    ) -> Result<DeviceInfo> {
        let (high_speed, eeprom) = self.query_device()?;
        let decoder = self.probe_decoder()?;

        self.prepare_encoder()?;
        self.load_firmware(firmware)?;
        self.release_encoder()?;

        self.ping_encoder()?;
        self.write_register(ENCODER_INTERRUPT_MASK, 0xbfff_ffff)?;

        self.preconfigure_encoder()?;
        self.configure_encoder(settings)?;
        self.start_encoder()?;

        self.select_input(input)?;
        self.set_audio_clock(settings.sample_rate)?;
        self.enable_decoder_outputs()?;

        Ok(DeviceInfo {
            high_speed,
            eeprom,
            decoder,
        })
    }

    /// Reads every documented register window.
    pub fn dump_registers(&mut self) -> Result<Vec<(u16, u32)>> {
        let mut dump = Vec::new();
        for (base, last) in DUMP_WINDOWS {
            for offset in (0..=*last).step_by(4) {
                let addr = base + offset;
                dump.push((addr, self.read_register(addr)?));
            }
        }
        Ok(dump)
    }
}
