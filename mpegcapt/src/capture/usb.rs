use std::collections::VecDeque;
use std::ffi::c_void;
use std::mem;
use std::os::raw::{c_int, c_uint};
use std::sync::{Arc, Mutex};
use std::time::Duration;
extern crate libusb1_sys as usbffi;

use bytes::BytesMut;
use log::{trace, warn};
use rusb::{DeviceHandle, UsbContext};
use usbffi::constants::*;

use crate::transport::{Completion, StreamTransport, TransferStatus};

/// Event pumps spent waiting for cancelled transfers when dropped.
const DROP_DRAIN_ATTEMPTS: usize = 64;

#[derive(Debug)]
struct Finished {
    slot: usize,
    status: c_int,
    actual_length: c_int,
}

type FinishedQueue = Arc<Mutex<VecDeque<Finished>>>;

/// Passed to libusb as the transfer's user data.
struct SlotTag {
    slot: usize,
    finished: FinishedQueue,
}

struct Slot {
    transfer: *mut usbffi::libusb_transfer,
    tag: Box<SlotTag>,
    /// Present while the transfer is owned by libusb.
    buffer: Option<BytesMut>,
}

/// Asynchronous bulk reads on a libusb device handle.
///
/// Completions are collected by the libusb callback and handed out by
/// [`StreamTransport::pump_events`], which runs the libusb event loop on the
/// calling thread.
pub struct UsbStream<'a, T: UsbContext> {
    handle: &'a DeviceHandle<T>,
    slots: Vec<Slot>,
    finished: FinishedQueue,
}

extern "system" fn transfer_finished(transfer_ptr: *mut usbffi::libusb_transfer) {
    let transfer: &usbffi::libusb_transfer = unsafe { &*transfer_ptr };

    let user_data = transfer.user_data as *const SlotTag;
    if user_data.is_null() {
        return;
    }
    let tag = unsafe { &*user_data };

    if let Ok(mut finished) = tag.finished.lock() {
        finished.push_back(Finished {
            slot: tag.slot,
            status: transfer.status,
            actual_length: transfer.actual_length,
        });
    }
}

fn usb_error(code: c_int) -> rusb::Error {
    match code {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

fn transfer_status(status: c_int) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

impl<'a, T: UsbContext> UsbStream<'a, T> {
    pub fn new(handle: &'a DeviceHandle<T>) -> Self {
        Self {
            handle,
            slots: Vec::new(),
            finished: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn slot(&mut self, slot: usize) -> Result<&mut Slot, rusb::Error> {
        while self.slots.len() <= slot {
            let transfer = unsafe { usbffi::libusb_alloc_transfer(0) };
            if transfer.is_null() {
                return Err(rusb::Error::NoMem);
            }
            self.slots.push(Slot {
                transfer,
                tag: Box::new(SlotTag {
                    slot: self.slots.len(),
                    finished: Arc::clone(&self.finished),
                }),
                buffer: None,
            });
        }
        Ok(&mut self.slots[slot])
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), rusb::Error> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let rc = unsafe {
            usbffi::libusb_handle_events_timeout(self.handle.context().as_raw(), &tv as *const _)
        };
        if rc < 0 && rc != LIBUSB_ERROR_INTERRUPTED {
            return Err(usb_error(rc));
        }
        Ok(())
    }

    fn take_finished(&mut self) -> Vec<Completion> {
        let finished: Vec<Finished> = match self.finished.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => return Vec::new(),
        };

        let mut completions = Vec::with_capacity(finished.len());
        for done in finished {
            let Some(buffer) = self.slots.get_mut(done.slot).and_then(|s| s.buffer.take()) else {
                continue;
            };
            trace!(
                "transfer {} status {} length {}",
                done.slot,
                done.status,
                done.actual_length
            );
            completions.push(Completion {
                slot: done.slot,
                buffer,
                actual_length: done.actual_length.max(0) as usize,
                status: transfer_status(done.status),
            });
        }
        completions
    }
}

impl<'a, T: UsbContext> StreamTransport for UsbStream<'a, T> {
    fn submit_read(
        &mut self,
        slot: usize,
        endpoint: u8,
        mut buffer: BytesMut,
        timeout: Duration,
    ) -> Result<(), rusb::Error> {
        let handle = self.handle.as_raw();
        let length = c_int::try_from(buffer.len()).map_err(|_| rusb::Error::InvalidParam)?;
        let entry = self.slot(slot)?;
        if entry.buffer.is_some() {
            return Err(rusb::Error::Busy);
        }

        let user_data = &*entry.tag as *const SlotTag as *mut c_void;
        let rc = unsafe {
            usbffi::libusb_fill_bulk_transfer(
                entry.transfer,
                handle,
                endpoint,
                buffer.as_mut_ptr(),
                length,
                transfer_finished as _,
                user_data,
                timeout.as_millis() as c_uint,
            );
            usbffi::libusb_submit_transfer(entry.transfer)
        };
        if rc != LIBUSB_SUCCESS {
            return Err(usb_error(rc));
        }

        // the heap allocation behind `buffer` stays put while libusb fills it
        entry.buffer = Some(buffer);
        Ok(())
    }

    fn cancel(&mut self, slot: usize) -> Result<(), rusb::Error> {
        let Some(entry) = self.slots.get(slot) else {
            return Ok(());
        };
        if entry.buffer.is_none() {
            return Ok(());
        }
        let rc = unsafe { usbffi::libusb_cancel_transfer(entry.transfer) };
        match rc {
            LIBUSB_SUCCESS | LIBUSB_ERROR_NOT_FOUND => Ok(()),
            _ => Err(usb_error(rc)),
        }
    }

    fn pump_events(&mut self, timeout: Duration) -> Result<Vec<Completion>, rusb::Error> {
        self.handle_events(timeout)?;
        Ok(self.take_finished())
    }

    fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.buffer.is_some()).count()
    }
}

impl<'a, T: UsbContext> Drop for UsbStream<'a, T> {
    fn drop(&mut self) {
        for slot in 0..self.slots.len() {
            let _ = self.cancel(slot);
        }

        let mut attempts = 0;
        while self.in_flight() > 0 && attempts < DROP_DRAIN_ATTEMPTS {
            attempts += 1;
            if self.handle_events(Duration::from_millis(100)).is_err() {
                break;
            }
            drop(self.take_finished());
        }

        for entry in self.slots.drain(..) {
            if let Some(buffer) = entry.buffer {
                // libusb may still write into it; leak rather than free
                warn!("transfer {} never completed, leaking it", entry.tag.slot);
                mem::forget(buffer);
                mem::forget(entry.tag);
                continue;
            }
            unsafe { usbffi::libusb_free_transfer(entry.transfer) };
        }
    }
}
