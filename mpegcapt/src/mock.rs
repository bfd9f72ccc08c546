//! In-memory stand-ins for the device used by the unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use bytes::BytesMut;

use crate::codec::{
    OP_I2C_READ, OP_I2C_WRITE, OP_MEMORY_READ, OP_MEMORY_WRITE, OP_REGISTER_READ,
    OP_REGISTER_WRITE,
};
use crate::encoder::{DOORBELL, MAILBOX, MAILBOX_RESULT, STATUS_COMPLETE};
use crate::transport::{Completion, StreamTransport, Transport, TransferStatus, EP_FIRMWARE_OUT};

#[derive(Debug, Clone)]
pub struct Write {
    pub endpoint: u8,
    pub data: Vec<u8>,
    pub timeout: Duration,
}

/// Decodes command frames and answers them from a register file, chip
/// memory, the decoder's I2C register space and an encoder mailbox.
pub struct MockDevice {
    pub writes: Vec<Write>,
    pub reads: usize,
    pub registers: HashMap<u16, u32>,
    pub memory: HashMap<u32, u32>,
    pub decoder: HashMap<u16, u8>,
    /// Scripted responses served before the generated ones.
    pub responses: VecDeque<Vec<u8>>,
    pending: VecDeque<Vec<u8>>,
    /// Byte counts reported for the next writes; such frames are dropped.
    pub short_writes: VecDeque<usize>,
    /// Firmware chunks received on the download endpoint.
    pub firmware: Vec<Vec<u8>>,
    pub firmware_short_at: Option<usize>,
    /// Mailbox poll on which the completion bit shows up; `None` never.
    pub completes_after: Option<u32>,
    pub result_code: u32,
    pub polls: u32,
    mailbox_busy: bool,
    /// Command blocks as they sat in the mailbox when the doorbell rang.
    pub commands: Vec<Vec<u32>>,
    pub speed: u8,
    pub eeprom: u8,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            writes: Vec::new(),
            reads: 0,
            registers: HashMap::new(),
            memory: HashMap::new(),
            decoder: HashMap::new(),
            responses: VecDeque::new(),
            pending: VecDeque::new(),
            short_writes: VecDeque::new(),
            firmware: Vec::new(),
            firmware_short_at: None,
            completes_after: Some(1),
            result_code: 0,
            polls: 0,
            mailbox_busy: false,
            commands: Vec::new(),
            speed: 0x80,
            eeprom: 0,
        }
    }

    /// Command codes of every block submitted, in order.
    pub fn command_codes(&self) -> Vec<u32> {
        self.commands.iter().map(|block| block[1]).collect()
    }

    fn handle_frame(&mut self, data: &[u8]) {
        match data[0] {
            OP_REGISTER_WRITE => {
                let value = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                let addr = u16::from_be_bytes([data[6], data[7]]);
                self.registers.insert(addr, value);
            }
            OP_REGISTER_READ => {
                let addr = u16::from_be_bytes([data[6], data[7]]);
                let value = self.registers.get(&addr).copied().unwrap_or(0);
                self.pending.push_back(value.to_le_bytes().to_vec());
            }
            OP_MEMORY_WRITE => {
                for word in data[1..].chunks(7) {
                    let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                    let addr = u32::from_be_bytes([0, word[4], word[5], word[6]]);
                    if data.len() == 8 && addr == MAILBOX && value == DOORBELL {
                        self.ring_doorbell();
                    }
                    self.memory.insert(addr, value);
                }
            }
            OP_MEMORY_READ => {
                let addr = u32::from_be_bytes([0, data[5], data[6], data[7]]);
                let mut value = self.memory.get(&addr).copied().unwrap_or(0);
                if addr == MAILBOX && self.mailbox_busy {
                    self.polls += 1;
                    if self.completes_after.map_or(false, |k| self.polls >= k) {
                        value |= STATUS_COMPLETE;
                    } else {
                        value &= !STATUS_COMPLETE;
                    }
                }
                self.pending.push_back(value.to_le_bytes().to_vec());
            }
            OP_I2C_WRITE => {
                let addr = u16::from_be_bytes([data[3], data[4]]);
                for (offset, byte) in data[5..].iter().enumerate() {
                    self.decoder.insert(addr + offset as u16, *byte);
                }
                self.pending.push_back(vec![0x08]);
            }
            OP_I2C_READ => {
                let len = data[2] as u16;
                let addr = u16::from_be_bytes([data[4], data[5]]);
                let mut response = vec![0x08];
                for offset in 0..len {
                    response.push(self.decoder.get(&(addr + offset)).copied().unwrap_or(0));
                }
                self.pending.push_back(response);
            }
            0x0b => self.pending.push_back(vec![self.speed]),
            0xeb => self.pending.push_back(vec![self.eeprom]),
            _ => {}
        }
    }

    fn ring_doorbell(&mut self) {
        let block = (0..16)
            .map(|n| self.memory.get(&(MAILBOX + n)).copied().unwrap_or(0))
            .collect();
        self.commands.push(block);
        self.polls = 0;
        self.mailbox_busy = true;
        self.memory.insert(MAILBOX_RESULT, self.result_code);
    }
}

impl Transport for MockDevice {
    fn bulk_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.writes.push(Write {
            endpoint,
            data: data.to_vec(),
            timeout,
        });

        if endpoint == EP_FIRMWARE_OUT {
            let index = self.firmware.len();
            self.firmware.push(data.to_vec());
            if self.firmware_short_at == Some(index) {
                return Ok(data.len() / 2);
            }
            return Ok(data.len());
        }

        if let Some(short) = self.short_writes.pop_front() {
            return Ok(short);
        }

        self.handle_frame(data);
        Ok(data.len())
    }

    fn bulk_read(
        &mut self,
        _endpoint: u8,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.reads += 1;
        let response = self
            .responses
            .pop_front()
            .or_else(|| self.pending.pop_front())
            .ok_or(rusb::Error::Timeout)?;
        let len = response.len().min(buf.len());
        buf[..len].copy_from_slice(&response[..len]);
        Ok(len)
    }
}

/// Completes submitted reads first-in first-out, one per pump, filling each
/// with the next payload from `script`.
pub struct MockStream {
    queue: VecDeque<(usize, BytesMut)>,
    pub script: Vec<Vec<u8>>,
    pub completed: usize,
    pub submissions: usize,
    pub fail_submit_at: Option<usize>,
    pub cancelled: HashSet<usize>,
    /// Bytes carried by transfers that come back cancelled.
    pub cancelled_payload: Vec<u8>,
    /// Status of each completion in turn; `Completed` once exhausted.
    pub statuses: VecDeque<TransferStatus>,
    pub endpoints: Vec<u8>,
}

impl MockStream {
    pub fn new(script: Vec<Vec<u8>>) -> Self {
        Self {
            queue: VecDeque::new(),
            script,
            completed: 0,
            submissions: 0,
            fail_submit_at: None,
            cancelled: HashSet::new(),
            cancelled_payload: Vec::new(),
            statuses: VecDeque::new(),
            endpoints: Vec::new(),
        }
    }
}

impl StreamTransport for MockStream {
    fn submit_read(
        &mut self,
        slot: usize,
        endpoint: u8,
        buffer: BytesMut,
        _timeout: Duration,
    ) -> Result<(), rusb::Error> {
        if self.fail_submit_at == Some(self.submissions) {
            return Err(rusb::Error::NoDevice);
        }
        self.submissions += 1;
        self.endpoints.push(endpoint);
        self.queue.push_back((slot, buffer));
        Ok(())
    }

    fn cancel(&mut self, slot: usize) -> Result<(), rusb::Error> {
        self.cancelled.insert(slot);
        Ok(())
    }

    fn pump_events(&mut self, _timeout: Duration) -> Result<Vec<Completion>, rusb::Error> {
        let Some((slot, mut buffer)) = self.queue.pop_front() else {
            return Ok(Vec::new());
        };

        if self.cancelled.remove(&slot) {
            let payload = &self.cancelled_payload;
            buffer[..payload.len()].copy_from_slice(payload);
            return Ok(vec![Completion {
                slot,
                buffer,
                actual_length: payload.len(),
                status: TransferStatus::Cancelled,
            }]);
        }

        let payload = &self.script[self.completed % self.script.len()];
        buffer[..payload.len()].copy_from_slice(payload);
        self.completed += 1;

        Ok(vec![Completion {
            slot,
            buffer,
            actual_length: payload.len(),
            status: self
                .statuses
                .pop_front()
                .unwrap_or(TransferStatus::Completed),
        }])
    }

    fn in_flight(&self) -> usize {
        self.queue.len()
    }
}
