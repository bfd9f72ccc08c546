//! Register, chip-memory and I2C transactions carried over the command
//! endpoints.
//!
//! Every operation is a blocking round-trip: one frame written to
//! [`EP_COMMAND_OUT`] and, when the operation returns data, one response read
//! from [`EP_COMMAND_IN`]. The device holds a single command path, so a
//! [`Device`] must not be shared between threads while a transaction is in
//! progress.

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use log::{trace, warn};

use crate::error::{Error, Result};
use crate::transport::{Transport, EP_COMMAND_IN, EP_COMMAND_OUT};

pub const OP_MEMORY_WRITE: u8 = 0x01;
pub const OP_MEMORY_READ: u8 = 0x02;
pub const OP_REGISTER_WRITE: u8 = 0x04;
pub const OP_REGISTER_READ: u8 = 0x05;
pub const OP_I2C_WRITE: u8 = 0x08;
pub const OP_I2C_READ: u8 = 0x09;

/// Bus address of the video decoder, as it appears in I2C frames.
pub const I2C_DECODER: u8 = 0x44;
/// Sub-command byte of an I2C read frame.
const I2C_READ_MODE: u8 = 0x02;
/// First byte of every I2C acknowledgement.
const I2C_ACK: u8 = 0x08;

pub const GPIO_DIRECTION: u16 = 0x9020;
pub const GPIO_OUTPUT: u16 = 0x900c;

/// Words packed into one memory-write frame.
const MEMORY_WORDS_PER_FRAME: usize = 8;
/// Data bytes + address bytes per packed memory word.
const MEMORY_WORD_STRIDE: usize = 7;
const RESPONSE_SIZE: usize = 256;

/// Timeouts applied to transactions. `Duration::ZERO` waits forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Register and memory transactions.
    pub transaction: Duration,
    /// I2C transactions to the video decoder.
    pub i2c: Duration,
    /// Single-byte vendor commands and firmware download.
    pub control: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            transaction: Duration::from_millis(1000),
            i2c: Duration::ZERO,
            control: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gpio {
    Direction,
    Output,
}

impl Gpio {
    pub fn register(self) -> u16 {
        match self {
            Gpio::Direction => GPIO_DIRECTION,
            Gpio::Output => GPIO_OUTPUT,
        }
    }
}

/// An open command path to the capture device.
pub struct Device<T> {
    transport: T,
    pub(crate) timeouts: Timeouts,
    pub(crate) poll: crate::encoder::PollConfig,
}

impl<T: Transport> Device<T> {
    pub fn new(transport: T) -> Self {
        Self::with_timeouts(transport, Timeouts::default())
    }

    pub fn with_timeouts(transport: T, timeouts: Timeouts) -> Self {
        Self {
            transport,
            timeouts,
            poll: Default::default(),
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Writes `frame` and fails unless the device took all of it.
    pub(crate) fn send(
        &mut self,
        op: &'static str,
        endpoint: u8,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        trace!("{} -> {:02x}: {}", op, endpoint, hex::encode(frame));
        let sent = self
            .transport
            .bulk_write(endpoint, frame, timeout)
            .map_err(Error::usb(op))?;
        if sent != frame.len() {
            return Err(Error::ShortTransfer {
                op,
                expected: frame.len(),
                actual: sent,
            });
        }
        Ok(())
    }

    /// Reads one response into `buf`, returning the received length.
    pub(crate) fn receive(
        &mut self,
        op: &'static str,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let len = self
            .transport
            .bulk_read(EP_COMMAND_IN, buf, timeout)
            .map_err(Error::usb(op))?;
        trace!("{} <- {}", op, hex::encode(&buf[..len]));
        Ok(len)
    }

    /// Reads a response that must be exactly `N` bytes long.
    fn receive_exact<const N: usize>(
        &mut self,
        op: &'static str,
        timeout: Duration,
    ) -> Result<[u8; N]> {
        let mut buf = [0u8; RESPONSE_SIZE];
        let len = self.receive(op, &mut buf, timeout)?;
        if len != N {
            return Err(Error::ShortTransfer {
                op,
                expected: N,
                actual: len,
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&buf[..N]);
        Ok(out)
    }

    pub fn write_register(&mut self, addr: u16, value: u32) -> Result<()> {
        let mut frame = BytesMut::with_capacity(8);
        frame.put_u8(OP_REGISTER_WRITE);
        frame.put_u32_le(value);
        frame.put_u8(0);
        frame.put_u16(addr);

        let timeout = self.timeouts.transaction;
        self.send("write_register", EP_COMMAND_OUT, &frame, timeout)
    }

    pub fn read_register(&mut self, addr: u16) -> Result<u32> {
        let mut frame = BytesMut::with_capacity(8);
        frame.put_u8(OP_REGISTER_READ);
        frame.put_bytes(0, 5);
        frame.put_u16(addr);

        let timeout = self.timeouts.transaction;
        self.send("read_register", EP_COMMAND_OUT, &frame, timeout)?;
        let value = self.receive_exact::<4>("read_register", timeout)?;
        Ok(u32::from_le_bytes(value))
    }

    /// Writes consecutive words of chip memory starting at `addr`. Words are
    /// packed eight to a frame, each carrying its own 24-bit address.
    pub fn write_memory_words(&mut self, addr: u32, words: &[u32]) -> Result<()> {
        let timeout = self.timeouts.transaction;
        let mut address = addr;

        for chunk in words.chunks(MEMORY_WORDS_PER_FRAME) {
            let mut frame = BytesMut::with_capacity(1 + MEMORY_WORD_STRIDE * chunk.len());
            frame.put_u8(OP_MEMORY_WRITE);
            for word in chunk {
                frame.put_u32_le(*word);
                put_u24(&mut frame, address);
                address = address.wrapping_add(1);
            }
            self.send("write_memory_words", EP_COMMAND_OUT, &frame, timeout)?;
        }

        Ok(())
    }

    pub fn write_memory_word(&mut self, addr: u32, word: u32) -> Result<()> {
        self.write_memory_words(addr, &[word])
    }

    pub fn read_memory_word(&mut self, addr: u32) -> Result<u32> {
        let mut frame = BytesMut::with_capacity(8);
        frame.put_u8(OP_MEMORY_READ);
        frame.put_bytes(0, 4);
        put_u24(&mut frame, addr);

        let timeout = self.timeouts.transaction;
        self.send("read_memory_word", EP_COMMAND_OUT, &frame, timeout)?;
        let value = self.receive_exact::<4>("read_memory_word", timeout)?;
        Ok(u32::from_le_bytes(value))
    }

    /// Writes `bytes` to decoder register `addr`.
    ///
    /// The acknowledgement is always read, even when the request itself came
    /// up short, so the response endpoint is left drained. The first failure
    /// is the one returned.
    pub fn i2c_write(&mut self, addr: u16, bytes: &[u8]) -> Result<()> {
        let len = u8::try_from(bytes.len() + 2)
            .map_err(|_| Error::Config(format!("i2c write of {} bytes", bytes.len())))?;

        let mut frame = BytesMut::with_capacity(5 + bytes.len());
        frame.put_u8(OP_I2C_WRITE);
        frame.put_u8(I2C_DECODER);
        frame.put_u8(len);
        frame.put_u16(addr);
        frame.put_slice(bytes);

        let timeout = self.timeouts.i2c;
        let sent = self.send("i2c_write", EP_COMMAND_OUT, &frame, timeout);
        if let Err(err) = &sent {
            warn!("i2c write {:#05x}: {}", addr, err);
        }

        let acked = self.receive_exact::<1>("i2c_write", timeout).and_then(|ack| {
            if ack[0] == I2C_ACK {
                Ok(())
            } else {
                Err(Error::BadResponse {
                    op: "i2c_write",
                    response: ack.to_vec(),
                })
            }
        });
        if let Err(err) = &acked {
            warn!("i2c write {:#05x} ack: {}", addr, err);
        }

        sent.and(acked)
    }

    pub fn i2c_read(&mut self, addr: u16, len: u8) -> Result<Vec<u8>> {
        let mut frame = BytesMut::with_capacity(6);
        frame.put_u8(OP_I2C_READ);
        frame.put_u8(I2C_READ_MODE);
        frame.put_u8(len);
        frame.put_u8(I2C_DECODER);
        frame.put_u16(addr);

        let timeout = self.timeouts.i2c;
        self.send("i2c_read", EP_COMMAND_OUT, &frame, timeout)?;

        let mut buf = [0u8; RESPONSE_SIZE];
        let received = self.receive("i2c_read", &mut buf, timeout)?;
        let expected = len as usize + 1;
        if received != expected {
            return Err(Error::ShortTransfer {
                op: "i2c_read",
                expected,
                actual: received,
            });
        }
        if buf[0] != I2C_ACK {
            return Err(Error::BadResponse {
                op: "i2c_read",
                response: buf[..received].to_vec(),
            });
        }

        Ok(buf[1..expected].to_vec())
    }

    /// Updates the bits of a GPIO register selected by `mask`. A full mask
    /// skips the read and writes `value` as-is.
    ///
    /// The read-modify-write is not atomic with respect to anything else
    /// touching the register.
    pub fn gpio_configure(&mut self, kind: Gpio, mask: u32, value: u32) -> Result<()> {
        let register = kind.register();
        let merged = if mask != u32::MAX {
            let old = self.read_register(register)?;
            (old & !mask) | (value & mask)
        } else {
            value
        };
        self.write_register(register, merged)
    }

    /// Sends a vendor command made of a few raw bytes.
    pub fn vendor_command(&mut self, bytes: &[u8]) -> Result<()> {
        let timeout = self.timeouts.control;
        self.send("vendor_command", EP_COMMAND_OUT, bytes, timeout)
    }

    /// Sends a vendor command and returns the first byte of its response.
    pub fn vendor_query(&mut self, bytes: &[u8]) -> Result<u8> {
        self.vendor_command(bytes)?;
        let mut buf = [0u8; 1024];
        let timeout = self.timeouts.control;
        let len = self.receive("vendor_query", &mut buf, timeout)?;
        if len == 0 {
            return Err(Error::ShortTransfer {
                op: "vendor_query",
                expected: 1,
                actual: 0,
            });
        }
        Ok(buf[0])
    }
}

fn put_u24(frame: &mut BytesMut, value: u32) {
    frame.put_u8((value >> 16) as u8);
    frame.put_u8((value >> 8) as u8);
    frame.put_u8(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    #[test]
    fn register_write_frame_layout() {
        let mut device = Device::new(MockDevice::new());
        device.write_register(0xa064, 0x1122_3344).unwrap();

        let sent = &device.transport().writes[0];
        assert_eq!(sent.endpoint, EP_COMMAND_OUT);
        assert_eq!(
            sent.data,
            vec![0x04, 0x44, 0x33, 0x22, 0x11, 0x00, 0xa0, 0x64]
        );
        assert_eq!(sent.timeout, Duration::from_millis(1000));
    }

    #[test]
    fn register_reads_back_written_value() {
        let mut device = Device::new(MockDevice::new());
        for (addr, value) in [(0x0048, 0xffff_ffff), (0x07f8, 0x8000_0800), (0xaa04, 0)] {
            device.write_register(addr, value).unwrap();
            assert_eq!(device.read_register(addr).unwrap(), value);
        }
    }

    #[test]
    fn short_register_write_is_reported() {
        let mut mock = MockDevice::new();
        mock.short_writes.push_back(5);
        let mut device = Device::new(mock);

        match device.write_register(0x0048, 1) {
            Err(Error::ShortTransfer {
                expected: 8,
                actual: 5,
                ..
            }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn register_read_requires_four_bytes() {
        let mut mock = MockDevice::new();
        mock.responses.push_back(vec![1, 2]);
        let mut device = Device::new(mock);

        assert!(matches!(
            device.read_register(0x9020),
            Err(Error::ShortTransfer {
                expected: 4,
                actual: 2,
                ..
            })
        ));
    }

    #[test]
    fn memory_words_are_chunked_by_eight() {
        let mut device = Device::new(MockDevice::new());
        let words: Vec<u32> = (0..19).map(|n| 0x0100_0000 + n).collect();
        device.write_memory_words(0x44, &words).unwrap();

        let frames = &device.transport().writes;
        let sizes: Vec<usize> = frames.iter().map(|w| w.data.len()).collect();
        assert_eq!(sizes, vec![57, 57, 22]);

        // second frame starts at word 8, address 0x4c
        let second = &frames[1].data;
        assert_eq!(second[0], 0x01);
        assert_eq!(&second[1..5], &0x0100_0008u32.to_le_bytes());
        assert_eq!(&second[5..8], &[0x00, 0x00, 0x4c]);

        for (n, word) in words.iter().enumerate() {
            assert_eq!(device.transport().memory[&(0x44 + n as u32)], *word);
        }
    }

    #[test]
    fn memory_read_frame_and_value() {
        let mut mock = MockDevice::new();
        mock.memory.insert(0x01_2345, 0xdead_beef);
        let mut device = Device::new(mock);

        assert_eq!(device.read_memory_word(0x01_2345).unwrap(), 0xdead_beef);
        assert_eq!(
            device.transport().writes[0].data,
            vec![0x02, 0, 0, 0, 0, 0x01, 0x23, 0x45]
        );
    }

    #[test]
    fn i2c_write_frame_and_ack() {
        let mut device = Device::new(MockDevice::new());
        device.i2c_write(0x0115, &[0x0c]).unwrap();

        let sent = &device.transport().writes[0];
        assert_eq!(sent.data, vec![0x08, 0x44, 0x03, 0x01, 0x15, 0x0c]);
        assert_eq!(sent.timeout, Duration::ZERO);
        assert_eq!(device.transport().decoder[&0x0115], 0x0c);
    }

    #[test]
    fn i2c_write_reports_bad_ack_after_reading_it() {
        let mut mock = MockDevice::new();
        mock.responses.push_back(vec![0x09]);
        let mut device = Device::new(mock);

        assert!(matches!(
            device.i2c_write(0x0103, &[0x00]),
            Err(Error::BadResponse { .. })
        ));
        assert!(device.transport().responses.is_empty());
    }

    #[test]
    fn i2c_write_short_send_still_drains_ack() {
        let mut mock = MockDevice::new();
        mock.short_writes.push_back(2);
        let mut device = Device::new(mock);

        assert!(matches!(
            device.i2c_write(0x0103, &[0x00]),
            Err(Error::ShortTransfer { op: "i2c_write", .. })
        ));
        assert_eq!(device.transport().reads, 1);
    }

    #[test]
    fn i2c_read_returns_payload() {
        let mut mock = MockDevice::new();
        mock.decoder.insert(0x100, 0x37);
        mock.decoder.insert(0x101, 0x83);
        let mut device = Device::new(mock);

        assert_eq!(device.i2c_read(0x100, 2).unwrap(), vec![0x37, 0x83]);
        assert_eq!(
            device.transport().writes[0].data,
            vec![0x09, 0x02, 0x02, 0x44, 0x01, 0x00]
        );
    }

    #[test]
    fn i2c_read_rejects_wrong_length() {
        let mut mock = MockDevice::new();
        mock.responses.push_back(vec![0x08, 0x01]);
        let mut device = Device::new(mock);

        assert!(matches!(
            device.i2c_read(0x100, 2),
            Err(Error::ShortTransfer {
                expected: 3,
                actual: 2,
                ..
            })
        ));
    }

    #[test]
    fn gpio_full_mask_skips_read() {
        let mut device = Device::new(MockDevice::new());
        device
            .gpio_configure(Gpio::Direction, 0xffff_ffff, 0x88)
            .unwrap();

        let writes = &device.transport().writes;
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].data[0], OP_REGISTER_WRITE);
        assert_eq!(device.transport().registers[&GPIO_DIRECTION], 0x88);
        assert_eq!(device.transport().reads, 0);
    }

    #[test]
    fn gpio_partial_mask_merges() {
        let mut mock = MockDevice::new();
        mock.registers.insert(GPIO_OUTPUT, 0xaaaa_aaa5);
        let mut device = Device::new(mock);
        device.gpio_configure(Gpio::Output, 0x0f, 0x3a).unwrap();

        let ops: Vec<u8> = device.transport().writes.iter().map(|w| w.data[0]).collect();
        assert_eq!(ops, vec![OP_REGISTER_READ, OP_REGISTER_WRITE]);
        assert_eq!(device.transport().registers[&GPIO_OUTPUT], 0xaaaa_aaaa);
    }

    #[test]
    fn vendor_query_returns_first_byte() {
        let mut mock = MockDevice::new();
        mock.responses.push_back(vec![0x80, 0x00, 0x12]);
        let mut device = Device::new(mock);

        assert_eq!(device.vendor_query(&[0x0b]).unwrap(), 0x80);
    }
}
