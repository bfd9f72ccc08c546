pub mod stream;
pub mod usb;

use log::info;
use rusb::{Device, DeviceDescriptor, DeviceHandle, UsbContext};

use crate::error::{Error, Result};

/// Vendor/product pairs of the supported CX23416 capture boxes.
pub const SUPPORTED_DEVICES: &[(u16, u16)] = &[(0x04bb, 0x0516), (0x0411, 0x0065)];

pub fn is_supported(vid: u16, pid: u16) -> bool {
    SUPPORTED_DEVICES.contains(&(vid, pid))
}

/// Finds the first supported device on the bus.
pub fn find_device<T: UsbContext>(context: &T) -> Result<Option<(Device<T>, DeviceDescriptor)>> {
    let devices = context.devices().map_err(Error::usb("list devices"))?;

    for device in devices.iter() {
        let device_desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };

        if is_supported(device_desc.vendor_id(), device_desc.product_id()) {
            return Ok(Some((device, device_desc)));
        }
    }

    Ok(None)
}

/// Opens the first supported device and claims its only interface.
pub fn open_device<T: UsbContext>(context: &T) -> Result<Option<DeviceHandle<T>>> {
    let Some((device, device_desc)) = find_device(context)? else {
        return Ok(None);
    };

    let mut handle = device.open().map_err(Error::usb("open device"))?;
    handle
        .claim_interface(0)
        .map_err(Error::usb("claim interface"))?;
    info!(
        "opened {:04x}:{:04x}",
        device_desc.vendor_id(),
        device_desc.product_id()
    );
    Ok(Some(handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_only_known_pairs() {
        assert!(is_supported(0x04bb, 0x0516));
        assert!(is_supported(0x0411, 0x0065));
        assert!(!is_supported(0x04bb, 0x0065));
        assert!(!is_supported(0x0752, 0x8613));
    }
}
