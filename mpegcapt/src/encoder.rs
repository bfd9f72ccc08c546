//! Mailbox protocol of the CX23416 MPEG encoder.
//!
//! A command is a block of sixteen words written to the mailbox in chip
//! memory. Ringing the doorbell hands the block to the encoder, which sets
//! [`STATUS_COMPLETE`] in the first mailbox word once it is done and leaves
//! its result code in the third.

use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::audio::SampleRate;
use crate::codec::Device;
use crate::error::{Error, Result};
use crate::transport::Transport;

pub const MAILBOX: u32 = 0x44;
pub const MAILBOX_RESULT: u32 = MAILBOX + 2;
pub const DOORBELL: u32 = 0x02 | 0x01;
pub const STATUS_COMPLETE: u32 = 0x04;

pub const COMMAND_WORDS: usize = 16;
pub const MAX_PARAMS: usize = 12;
const COMMAND_TIMEOUT: u32 = 0x0006_0000;

pub type CommandBlock = [u32; COMMAND_WORDS];

pub mod cmd {
    pub const PING: u16 = 0x80;
    pub const START_CAPTURE: u16 = 0x81;
    pub const SET_FRAME_RATE: u16 = 0x8f;
    pub const SET_FRAME_SIZE: u16 = 0x91;
    pub const SET_BIT_RATE: u16 = 0x95;
    pub const SET_GOP_PROPERTIES: u16 = 0x97;
    pub const SET_ASPECT_RATIO: u16 = 0x99;
    pub const SET_SPATIAL_FILTER_TYPE: u16 = 0xa1;
    pub const SET_3_2_PULLDOWN: u16 = 0xb1;
    pub const SET_VBI_LINE: u16 = 0xb7;
    pub const SET_STREAM_TYPE: u16 = 0xb9;
    pub const SET_OUTPUT_PORT: u16 = 0xbb;
    pub const SET_AUDIO_PROPERTIES: u16 = 0xbd;
    pub const SET_GOP_CLOSURE: u16 = 0xc5;
    pub const SET_PGM_INDEX_INFO: u16 = 0xc7;
    pub const INITIALIZE_INPUT: u16 = 0xcd;
    pub const SET_EVENT_NOTIFICATION: u16 = 0xd5;
    pub const SET_NUM_VSYNC_LINES: u16 = 0xd6;
    pub const MUTE_VIDEO: u16 = 0xd9;
    pub const MISC: u16 = 0xdc;
}

/// Bounded completion polling for [`Device::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1000,
            delay: Duration::from_micros(100),
        }
    }
}

/// Lays out a command block: reserved, command, reserved, timeout, then the
/// parameters zero-padded to twelve words.
pub fn build_command(cmd: u16, params: &[u32]) -> Result<CommandBlock> {
    if params.len() > MAX_PARAMS {
        return Err(Error::Config(format!(
            "command {:#04x} takes at most {} parameters, got {}",
            cmd,
            MAX_PARAMS,
            params.len()
        )));
    }

    let mut block = [0u32; COMMAND_WORDS];
    block[1] = cmd as u32;
    block[3] = COMMAND_TIMEOUT;
    block[4..4 + params.len()].copy_from_slice(params);
    Ok(block)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectRatio {
    Square = 1,
    Standard = 2,
    Wide = 3,
    Cinema = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitrateMode {
    Variable = 0,
    Constant = 1,
}

/// Literal encoder parameters applied by [`Device::configure_encoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub output_port: u32,
    pub width: u32,
    pub height: u32,
    /// 0 for 30 fps (NTSC), 1 for 25 fps (PAL).
    pub frame_rate: u32,
    pub aspect_ratio: AspectRatio,
    pub stream_type: u32,
    pub bitrate_mode: BitrateMode,
    pub bitrate: u32,
    pub peak_bitrate: u32,
    pub gop_size: u32,
    pub gop_b_frames: u32,
    pub gop_closure: bool,
    pub pulldown: bool,
    pub sample_rate: SampleRate,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            output_port: 1,
            width: 720,
            height: 480,
            frame_rate: 0,
            aspect_ratio: AspectRatio::Standard,
            stream_type: 0,
            bitrate_mode: BitrateMode::Variable,
            bitrate: 6_000_000,
            peak_bitrate: 8_000_000,
            gop_size: 15,
            gop_b_frames: 3,
            gop_closure: false,
            pulldown: false,
            sample_rate: SampleRate::Hz32000,
        }
    }
}

/// Audio properties word: MPEG-1 layer II, 224 kbit/s, stereo, with the
/// sample rate in the low two bits.
const AUDIO_PROPERTIES_BASE: u32 = 0x40b8;

impl<T: Transport> Device<T> {
    pub fn set_poll_config(&mut self, poll: PollConfig) {
        self.poll = poll;
    }

    /// Runs one command block through the mailbox and waits for its result.
    pub fn execute(&mut self, block: &CommandBlock) -> Result<()> {
        let command = block[1];
        self.write_memory_words(MAILBOX, block)?;
        self.write_memory_word(MAILBOX, DOORBELL)?;

        let poll = self.poll;
        let mut attempts = 0;
        loop {
            let status = self.read_memory_word(MAILBOX)?;
            attempts += 1;
            if attempts >= poll.max_attempts {
                return Err(Error::Timeout { command, attempts });
            }
            if status & STATUS_COMPLETE != 0 {
                break;
            }
            thread::sleep(poll.delay);
        }

        let code = self.read_memory_word(MAILBOX_RESULT)?;
        debug!(
            "encoder command {:#04x} done after {} polls, result {:#x}",
            command, attempts, code
        );
        if code != 0 {
            return Err(Error::DeviceRejected { command, code });
        }
        Ok(())
    }

    /// Builds and executes `cmd` with `params`.
    pub fn command(&mut self, cmd: u16, params: &[u32]) -> Result<()> {
        let block = build_command(cmd, params)?;
        self.execute(&block)
    }

    pub fn ping_encoder(&mut self) -> Result<()> {
        self.command(cmd::PING, &[])?;
        info!("cx23416 responding");
        Ok(())
    }

    pub fn set_output_port(&mut self, port: u32) -> Result<()> {
        self.command(cmd::SET_OUTPUT_PORT, &[port, 0])
    }

    pub fn set_pgm_index_info(&mut self, picture_mask: u32, entries: u32) -> Result<()> {
        self.command(cmd::SET_PGM_INDEX_INFO, &[picture_mask, entries])
    }

    pub fn set_num_vsync_lines(&mut self, field1: u32, field2: u32) -> Result<()> {
        self.command(cmd::SET_NUM_VSYNC_LINES, &[field1, field2])
    }

    pub fn set_event_notification(
        &mut self,
        event: u32,
        enable: u32,
        mask: u32,
        id: u32,
    ) -> Result<()> {
        self.command(cmd::SET_EVENT_NOTIFICATION, &[event, enable, mask, id])
    }

    pub fn set_frame_rate(&mut self, rate: u32) -> Result<()> {
        self.command(cmd::SET_FRAME_RATE, &[rate])
    }

    pub fn set_frame_size(&mut self, width: u32, height: u32) -> Result<()> {
        self.command(cmd::SET_FRAME_SIZE, &[height, width])
    }

    pub fn set_aspect_ratio(&mut self, ratio: AspectRatio) -> Result<()> {
        self.command(cmd::SET_ASPECT_RATIO, &[ratio as u32])
    }

    pub fn set_vbi_line(&mut self, line: u32) -> Result<()> {
        self.command(cmd::SET_VBI_LINE, &[line, 0, 0, 0, 0])
    }

    pub fn set_stream_type(&mut self, stream_type: u32) -> Result<()> {
        self.command(cmd::SET_STREAM_TYPE, &[stream_type])
    }

    /// `peak` is in bit/s; the encoder takes it in units of 400 bit/s.
    pub fn set_bit_rate(&mut self, mode: BitrateMode, bitrate: u32, peak: u32) -> Result<()> {
        if peak < bitrate {
            return Err(Error::Config(format!(
                "peak bitrate {} below bitrate {}",
                peak, bitrate
            )));
        }
        self.command(
            cmd::SET_BIT_RATE,
            &[mode as u32, bitrate, peak / 400, 0, 0, 0],
        )
    }

    pub fn set_gop_properties(&mut self, frames: u32, b_frames: u32) -> Result<()> {
        self.command(cmd::SET_GOP_PROPERTIES, &[frames, b_frames])
    }

    pub fn set_3_2_pulldown(&mut self, enable: bool) -> Result<()> {
        self.command(cmd::SET_3_2_PULLDOWN, &[enable as u32])
    }

    pub fn set_gop_closure(&mut self, closed: bool) -> Result<()> {
        self.command(cmd::SET_GOP_CLOSURE, &[closed as u32])
    }

    pub fn set_audio_properties(&mut self, rate: SampleRate) -> Result<()> {
        self.command(
            cmd::SET_AUDIO_PROPERTIES,
            &[AUDIO_PROPERTIES_BASE | rate.encoder_bits()],
        )
    }

    pub fn set_spatial_filter_type(&mut self, luma: u32, chroma: u32) -> Result<()> {
        self.command(cmd::SET_SPATIAL_FILTER_TYPE, &[luma, chroma])
    }

    pub fn initialize_input(&mut self) -> Result<()> {
        self.command(cmd::INITIALIZE_INPUT, &[])
    }

    pub fn mute_video(&mut self, mute: bool) -> Result<()> {
        self.command(cmd::MUTE_VIDEO, &[mute as u32])
    }

    pub fn start_capture(&mut self) -> Result<()> {
        // MPEG stream, program stream with index data
        self.command(cmd::START_CAPTURE, &[0, 0x13])?;
        info!("cx23416 started");
        Ok(())
    }

    /// Board-specific setup issued through the encoder's misc command.
    pub fn preconfigure_encoder(&mut self) -> Result<()> {
        const MISC: [&[u32]; 5] = [
            &[3, 1, 0, 0],
            &[8, 0, 0, 0],
            &[0, 3, 0, 0],
            &[15, 0, 0, 0],
            &[4, 1],
        ];
        for params in MISC {
            self.command(cmd::MISC, params)?;
        }
        Ok(())
    }

    pub fn configure_encoder(&mut self, settings: &EncoderSettings) -> Result<()> {
        self.set_output_port(settings.output_port)?;
        self.set_pgm_index_info(7, 400)?;
        self.set_num_vsync_lines(320, 320)?;
        self.set_event_notification(0, 0, 0x1000_0000, 0xffff_ffff)?;
        self.set_frame_rate(settings.frame_rate)?;
        self.set_frame_size(settings.width, settings.height)?;
        self.set_aspect_ratio(settings.aspect_ratio)?;
        self.set_vbi_line(0xffff_ffff)?;
        self.set_stream_type(settings.stream_type)?;
        self.set_bit_rate(
            settings.bitrate_mode,
            settings.bitrate,
            settings.peak_bitrate,
        )?;
        self.set_gop_properties(settings.gop_size, settings.gop_b_frames)?;
        self.set_3_2_pulldown(settings.pulldown)?;
        self.set_gop_closure(settings.gop_closure)?;
        self.set_audio_properties(settings.sample_rate)?;
        self.set_spatial_filter_type(1, 1)?;
        self.initialize_input()
    }

    pub fn start_encoder(&mut self) -> Result<()> {
        self.mute_video(false)?;
        self.start_capture()
    }
}
