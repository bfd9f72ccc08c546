use std::io;

/// Errors raised while talking to the capture device.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The USB stack reported a failed transfer.
    #[error("{op}: usb transfer failed: {source}")]
    Usb {
        op: &'static str,
        #[source]
        source: rusb::Error,
    },

    /// A transfer completed but moved the wrong number of bytes.
    #[error("{op}: transferred {actual} bytes, expected {expected}")]
    ShortTransfer {
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The device answered with an unexpected acknowledgement.
    #[error("{op}: unexpected response {}", hex::encode(.response))]
    BadResponse { op: &'static str, response: Vec<u8> },

    /// Encoder command never raised its completion bit.
    #[error("encoder command {command:#04x} did not complete after {attempts} polls")]
    Timeout { command: u32, attempts: u32 },

    /// Encoder completed the command with a nonzero result code.
    #[error("encoder command {command:#04x} rejected with code {code:#x}")]
    DeviceRejected { command: u32, code: u32 },

    /// Out-of-range values supplied by the caller.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("capture sink: {0}")]
    Sink(#[source] io::Error),

    #[error("capture sink accepted {written} of {expected} bytes")]
    ShortSinkWrite { expected: usize, written: usize },

    #[error("firmware source: {0}")]
    Firmware(#[source] io::Error),
}

impl Error {
    pub(crate) fn usb(op: &'static str) -> impl FnOnce(rusb::Error) -> Error {
        move |source| Error::Usb { op, source }
    }

    /// True for transport, sink and firmware-source failures.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            Error::Usb { .. }
                | Error::ShortTransfer { .. }
                | Error::BadResponse { .. }
                | Error::Sink(_)
                | Error::ShortSinkWrite { .. }
                | Error::Firmware(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
