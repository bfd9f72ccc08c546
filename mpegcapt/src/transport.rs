use std::time::Duration;

use bytes::BytesMut;
use rusb::{DeviceHandle, UsbContext};

/// Host to device command endpoint.
pub const EP_COMMAND_OUT: u8 = 0x01;
/// Device to host command response endpoint.
pub const EP_COMMAND_IN: u8 = 0x81;
/// Encoder firmware download endpoint.
pub const EP_FIRMWARE_OUT: u8 = 0x02;
/// MPEG stream endpoint.
pub const EP_STREAM_IN: u8 = 0x84;

/// Synchronous bulk transfers, one blocking round-trip per call.
pub trait Transport {
    fn bulk_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;

    fn bulk_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;
}

impl<T: UsbContext> Transport for DeviceHandle<T> {
    fn bulk_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.write_bulk(endpoint, data, timeout)
    }

    fn bulk_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.read_bulk(endpoint, buf, timeout)
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn bulk_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        (**self).bulk_write(endpoint, data, timeout)
    }

    fn bulk_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        (**self).bulk_read(endpoint, buf, timeout)
    }
}

/// How an asynchronous read finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
    Error,
}

impl TransferStatus {
    /// Whether the slot should go straight back to the device. Only a
    /// vanished device ends the stream.
    pub fn rearm(self) -> bool {
        self != TransferStatus::NoDevice
    }

    /// Completed or timed out with whatever data arrived.
    pub fn is_clean(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::TimedOut)
    }
}

/// A finished asynchronous read. Ownership of the slot buffer returns to the
/// caller along with the number of valid bytes at its front.
#[derive(Debug)]
pub struct Completion {
    pub slot: usize,
    pub buffer: BytesMut,
    pub actual_length: usize,
    pub status: TransferStatus,
}

impl Completion {
    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }
}

/// Asynchronous bulk reads driven by an explicit event pump.
///
/// A buffer handed to `submit_read` belongs to the transport until it comes
/// back inside a [`Completion`] from `pump_events`.
pub trait StreamTransport {
    fn submit_read(
        &mut self,
        slot: usize,
        endpoint: u8,
        buffer: BytesMut,
        timeout: Duration,
    ) -> Result<(), rusb::Error>;

    /// Best-effort; the slot still completes (as cancelled) through
    /// `pump_events`.
    fn cancel(&mut self, slot: usize) -> Result<(), rusb::Error>;

    /// Waits up to `timeout` for pending transfers and returns the ones that
    /// finished, in completion order.
    fn pump_events(&mut self, timeout: Duration) -> Result<Vec<Completion>, rusb::Error>;

    fn in_flight(&self) -> usize;
}
