use std::io::{self, ErrorKind, Read};

use log::{debug, info};

use crate::codec::Device;
use crate::error::{Error, Result};
use crate::transport::{Transport, EP_FIRMWARE_OUT};

/// Every firmware transfer carries exactly this many bytes.
pub const FIRMWARE_CHUNK: usize = 0x8000;

/// Size of a CX23416 image as embedded in the vendor Windows driver.
pub const FIRMWARE_IMAGE_SIZE: usize = 0x40000;

/// Bytes that follow the two-byte image header (`a7 0d`).
const IMAGE_SIGNATURE: [u8; 6] = [0x00, 0x00, 0x66, 0xbb, 0x55, 0xaa];
const SIGNATURE_OFFSET: usize = 2;

/// Offsets of every encoder firmware image inside a driver binary.
pub fn find_images(driver: &[u8]) -> Vec<usize> {
    driver
        .windows(IMAGE_SIGNATURE.len())
        .enumerate()
        .filter(|(pos, window)| *window == IMAGE_SIGNATURE && *pos >= SIGNATURE_OFFSET)
        .map(|(pos, _)| pos - SIGNATURE_OFFSET)
        .collect()
}

/// Cuts the image starting at `offset` out of a driver binary.
pub fn extract_image(driver: &[u8], offset: usize) -> Result<&[u8]> {
    driver
        .get(offset..offset + FIRMWARE_IMAGE_SIZE)
        .ok_or_else(|| {
            Error::Firmware(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "image at {:#x} runs past the end of the driver ({} bytes)",
                    offset,
                    driver.len()
                ),
            ))
        })
}

/// Reverses the bytes of every 32-bit word in place. A trailing partial word
/// is left untouched.
pub fn swap_words(chunk: &mut [u8]) {
    for word in chunk.chunks_exact_mut(4) {
        word.reverse();
    }
}

/// Fills `buf` from `source`, returning how many bytes were read before the
/// source ran dry.
fn read_chunk<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(Error::Firmware(err)),
        }
    }
    Ok(filled)
}

impl<T: Transport> Device<T> {
    /// Streams the encoder firmware image to the download endpoint.
    ///
    /// The image is sent in [`FIRMWARE_CHUNK`]-sized transfers with every
    /// 32-bit word byte-reversed; a short final chunk is zero-padded. The
    /// first failed or short transfer aborts the download.
    pub fn load_firmware<R: Read>(&mut self, mut source: R) -> Result<usize> {
        let timeout = self.timeouts.control;
        let mut chunk = vec![0u8; FIRMWARE_CHUNK];
        let mut chunks = 0;

        loop {
            let len = read_chunk(&mut source, &mut chunk)?;
            if len == 0 {
                break;
            }
            chunk[len..].fill(0);
            swap_words(&mut chunk);

            let sent = self
                .transport_mut()
                .bulk_write(EP_FIRMWARE_OUT, &chunk, timeout)
                .map_err(Error::usb("load_firmware"))?;
            if sent != FIRMWARE_CHUNK {
                return Err(Error::ShortTransfer {
                    op: "load_firmware",
                    expected: FIRMWARE_CHUNK,
                    actual: sent,
                });
            }
            chunks += 1;
            debug!("firmware chunk {} sent", chunks);

            if len < FIRMWARE_CHUNK {
                break;
            }
        }

        info!("cx23416 firmware downloaded ({} chunks)", chunks);
        Ok(chunks)
    }
}
