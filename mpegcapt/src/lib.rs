pub mod audio;
pub mod bringup;
pub mod capture;
pub mod codec;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod firmware;
pub mod transport;

#[cfg(test)]
mod mock;

use std::io::{Read, Write};

use rusb::{Context, DeviceHandle};

pub use audio::SampleRate;
pub use bringup::DeviceInfo;
pub use capture::stream::{CancelHandle, CapturePipeline, StreamConfig};
pub use codec::{Device, Gpio, Timeouts};
pub use decoder::InputSource;
pub use encoder::{build_command, EncoderSettings, PollConfig};
pub use error::{Error, Result};

/// An opened capture box: the libusb context plus the command path to the
/// device.
pub struct Mpegcapt {
    device: Device<DeviceHandle<Context>>,
    stream: StreamConfig,
    usb_context: Context,
}

impl Mpegcapt {
    /// Opens the first supported device on the bus. `Ok(None)` when nothing
    /// is plugged in.
    pub fn connect() -> Result<Option<Self>> {
        Self::connect_with(Timeouts::default(), StreamConfig::default())
    }

    pub fn connect_with(timeouts: Timeouts, stream: StreamConfig) -> Result<Option<Self>> {
        let usb_context = Context::new().map_err(Error::usb("init libusb"))?;
        let Some(handle) = capture::open_device(&usb_context)? else {
            return Ok(None);
        };

        Ok(Some(Self {
            device: Device::with_timeouts(handle, timeouts),
            stream,
            usb_context,
        }))
    }

    pub fn device(&mut self) -> &mut Device<DeviceHandle<Context>> {
        &mut self.device
    }

    pub fn context(&self) -> &Context {
        &self.usb_context
    }

    pub fn bring_up<R: Read>(
        &mut self,
        firmware: R,
        settings: &EncoderSettings,
        input: InputSource,
    ) -> Result<DeviceInfo> {
        self.device.bring_up(firmware, settings, input)
    }

    /// Queues the stream transfers, starts the device streaming and writes
    /// everything it sends to `sink` until `cancel` fires.
    pub fn capture<W: Write>(&mut self, sink: W, cancel: &CancelHandle) -> Result<()> {
        let stream = capture::usb::UsbStream::new(self.device.transport());
        let mut pipeline = CapturePipeline::start(stream, sink, self.stream)?;

        // the device handle is shared with the queued transfers from here on
        let handle = self.device.transport();
        let timeout = self.device.timeouts().control;
        let started = handle
            .write_bulk(
                transport::EP_COMMAND_OUT,
                &[bringup::vendor::STREAM_START],
                timeout,
            )
            .map_err(Error::usb("start stream"));
        if let Err(err) = started {
            pipeline.stop()?;
            return Err(err);
        }
        log::info!("usb stream started");

        pipeline.run(cancel)
    }
}

impl Drop for Mpegcapt {
    fn drop(&mut self) {
        if let Err(err) = self.device.transport_mut().release_interface(0) {
            log::debug!("release interface 0: {}", err);
        }
    }
}
