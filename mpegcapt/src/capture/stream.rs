//! Continuous capture of the encoder's transport stream.
//!
//! A fixed pool of read transfers stays queued on the stream endpoint. Each
//! completed transfer is written to the sink and immediately handed back to
//! the device, so the encoder always has a free buffer to fill while the
//! previous one is being flushed.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transport::{Completion, StreamTransport, EP_STREAM_IN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub endpoint: u8,
    pub slots: usize,
    pub buffer_size: usize,
    /// Per-transfer completion timeout.
    pub timeout: Duration,
    /// Upper bound on a single event pump.
    pub event_timeout: Duration,
    /// Event pumps allowed for cancelled transfers to come back on stop.
    pub drain_attempts: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: EP_STREAM_IN,
            slots: 2,
            buffer_size: 0x20000,
            timeout: Duration::from_millis(1000),
            event_timeout: Duration::from_millis(100),
            drain_attempts: 16,
        }
    }
}

/// Shared flag that asks a running capture to wind down.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Streaming,
    Stopped,
}

pub struct CapturePipeline<S: StreamTransport, W: Write> {
    transport: S,
    sink: Option<W>,
    config: StreamConfig,
    state: State,
    outstanding: usize,
    bytes_written: u64,
    completions: u64,
}

impl<S: StreamTransport, W: Write> CapturePipeline<S, W> {
    /// Allocates the slot buffers and queues every one of them on the
    /// stream endpoint. On a failed submission the transfers already queued
    /// are cancelled and drained before the error is returned.
    pub fn start(transport: S, sink: W, config: StreamConfig) -> Result<Self> {
        if config.slots == 0 || config.buffer_size == 0 {
            return Err(Error::Config(format!(
                "capture needs at least one slot and a non-empty buffer, got {} x {}",
                config.slots, config.buffer_size
            )));
        }

        let mut pipeline = Self {
            transport,
            sink: Some(sink),
            config,
            state: State::Streaming,
            outstanding: 0,
            bytes_written: 0,
            completions: 0,
        };

        for slot in 0..config.slots {
            let mut buffer = BytesMut::with_capacity(config.buffer_size);
            buffer.resize(config.buffer_size, 0);
            if let Err(err) = pipeline.submit(slot, buffer) {
                pipeline.shutdown();
                return Err(err);
            }
        }

        info!(
            "capture started: {} transfers of {} bytes on endpoint {:02x}",
            config.slots, config.buffer_size, config.endpoint
        );
        Ok(pipeline)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn completions(&self) -> u64 {
        self.completions
    }

    pub fn transport(&self) -> &S {
        &self.transport
    }

    fn submit(&mut self, slot: usize, buffer: BytesMut) -> Result<()> {
        self.transport
            .submit_read(slot, self.config.endpoint, buffer, self.config.timeout)
            .map_err(Error::usb("submit_read"))?;
        self.outstanding += 1;
        Ok(())
    }

    /// One dispatch step: waits for pending transfers and handles every
    /// completion. Returns the number of completions handled.
    ///
    /// A sink failure stops the pipeline before the error is returned.
    pub fn pump(&mut self) -> Result<usize> {
        if self.state == State::Stopped {
            return Ok(0);
        }

        let completions = match self.transport.pump_events(self.config.event_timeout) {
            Ok(completions) => completions,
            Err(err) => {
                self.shutdown();
                return Err(Error::usb("pump_events")(err));
            }
        };

        let handled = completions.len();
        let mut completions = completions.into_iter();
        while let Some(completion) = completions.next() {
            if let Err(err) = self.complete(completion) {
                // slots in the rest of this batch are already back in our hands
                self.outstanding -= completions.len();
                self.shutdown();
                return Err(err);
            }
        }
        Ok(handled)
    }

    fn complete(&mut self, completion: Completion) -> Result<()> {
        self.outstanding -= 1;
        self.completions += 1;

        if completion.actual_length > 0 {
            self.write_payload(completion.payload())?;
        }

        if !completion.status.is_clean() {
            warn!(
                "transfer {} finished with {:?}",
                completion.slot, completion.status
            );
        }
        if !completion.status.rearm() {
            return Err(Error::Usb {
                op: "capture",
                source: rusb::Error::NoDevice,
            });
        }

        self.submit(completion.slot, completion.buffer)
    }

    /// Writes one payload with a single `write` call. A sink that fails or
    /// takes fewer bytes is dropped on the spot and never written or flushed
    /// again.
    fn write_payload(&mut self, payload: &[u8]) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        let err = match sink.write(payload) {
            Ok(written) if written == payload.len() => {
                self.bytes_written += written as u64;
                return Ok(());
            }
            Ok(written) => Error::ShortSinkWrite {
                expected: payload.len(),
                written,
            },
            Err(err) => Error::Sink(err),
        };
        self.sink = None;
        Err(err)
    }

    /// Pumps events until `cancel` fires or an error occurs, then stops.
    pub fn run(&mut self, cancel: &CancelHandle) -> Result<()> {
        while self.state == State::Streaming {
            if cancel.is_cancelled() {
                info!("capture cancelled");
                break;
            }
            self.pump()?;
        }
        self.stop()
    }

    /// Cancels outstanding transfers, waits for them to come back and closes
    /// the sink. Calling it again does nothing.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == State::Stopped {
            return Ok(());
        }
        self.state = State::Stopped;
        self.drain();

        info!(
            "capture stopped after {} transfers, {} bytes",
            self.completions, self.bytes_written
        );
        match self.sink.take() {
            Some(mut sink) => sink.flush().map_err(Error::Sink),
            None => Ok(()),
        }
    }

    /// Stop on an error path; the triggering error wins over a flush failure.
    fn shutdown(&mut self) {
        if let Err(err) = self.stop() {
            warn!("capture shutdown: {}", err);
        }
    }

    fn drain(&mut self) {
        for slot in 0..self.config.slots {
            if let Err(err) = self.transport.cancel(slot) {
                debug!("cancel transfer {}: {}", slot, err);
            }
        }

        let mut attempts = 0;
        while self.outstanding > 0 && attempts < self.config.drain_attempts {
            attempts += 1;
            match self.transport.pump_events(self.config.event_timeout) {
                Ok(completions) => {
                    for completion in completions {
                        self.outstanding -= 1;
                        if completion.actual_length == 0 {
                            continue;
                        }
                        if self.sink.is_none() {
                            debug!("discarding {} bytes on stop", completion.actual_length);
                        } else if let Err(err) = self.write_payload(completion.payload()) {
                            warn!("dropping {} bytes on stop: {}", completion.actual_length, err);
                        }
                    }
                }
                Err(err) => {
                    warn!("draining transfers: {}", err);
                    break;
                }
            }
        }

        if self.outstanding > 0 {
            warn!("{} transfers still outstanding after stop", self.outstanding);
        }
    }
}

impl<S: StreamTransport, W: Write> Drop for CapturePipeline<S, W> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
