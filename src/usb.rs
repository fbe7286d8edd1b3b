use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};

use crate::error::{Error, TransportError};
use crate::transport::{ShutdownHandle, Transport};

pub const GOLDLEAF_VID: u16 = 0x057E;
pub const GOLDLEAF_PID: u16 = 0x3000;

const INTERFACE: u8 = 0;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Reads poll at this interval so a shutdown request is noticed promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receive buffer; a multiple of the 512-byte bulk packet size.
const RX_BUFFER: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbOptions {
    pub vendor_id: u16,
    pub product_id: u16,
    pub write_timeout: Duration,
}

impl Default for UsbOptions {
    fn default() -> Self {
        UsbOptions {
            vendor_id: GOLDLEAF_VID,
            product_id: GOLDLEAF_PID,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Bulk IN/OUT pipe to the client over libusb.
///
/// Bulk reads may deliver more than one frame's worth of bytes, or less; the
/// surplus is kept in `rx` and handed out by later `read_exact` calls.
pub struct UsbTransport {
    handle: DeviceHandle<Context>,
    ep_in: u8,
    ep_out: u8,
    write_timeout: Duration,
    shutdown: ShutdownHandle,
    rx: Vec<u8>,
    rx_start: usize,
    rx_end: usize,
}

fn find_device(ctx: &Context, options: &UsbOptions) -> Result<Device<Context>, Error> {
    ctx.devices()
        .map_err(Error::UsbOpen)?
        .iter()
        .find(|dev| {
            dev.device_descriptor()
                .map(|d| d.vendor_id() == options.vendor_id && d.product_id() == options.product_id)
                .unwrap_or(false)
        })
        .ok_or(Error::DeviceNotFound {
            vendor_id: options.vendor_id,
            product_id: options.product_id,
        })
}

/// Locate the first bulk IN and bulk OUT endpoints of `INTERFACE`.
fn bulk_endpoints(device: &Device<Context>) -> Result<(u8, u8), Error> {
    let config = device.active_config_descriptor().map_err(Error::UsbOpen)?;

    let mut ep_in = None;
    let mut ep_out = None;
    for interface in config.interfaces() {
        for desc in interface.descriptors() {
            if desc.interface_number() != INTERFACE {
                continue;
            }
            for ep in desc.endpoint_descriptors() {
                if ep.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match ep.direction() {
                    Direction::In => ep_in.get_or_insert(ep.address()),
                    Direction::Out => ep_out.get_or_insert(ep.address()),
                };
            }
        }
    }

    match (ep_in, ep_out) {
        (Some(ep_in), Some(ep_out)) => Ok((ep_in, ep_out)),
        _ => Err(Error::NoBulkEndpoints(INTERFACE)),
    }
}

impl UsbTransport {
    /// Scan the USB bus for the client, open it and claim the interface.
    pub fn open(options: &UsbOptions, shutdown: ShutdownHandle) -> Result<Self, Error> {
        let ctx = Context::new().map_err(Error::UsbOpen)?;
        let device = find_device(&ctx, options)?;
        let (ep_in, ep_out) = bulk_endpoints(&device)?;

        let mut handle = device.open().map_err(Error::UsbOpen)?;

        // Not supported on every platform.
        let _ = handle.set_auto_detach_kernel_driver(true);
        // Already configured on most hosts; a busy error here is harmless.
        let _ = handle.set_active_configuration(1);

        handle
            .claim_interface(INTERFACE)
            .map_err(Error::UsbOpen)?;

        let product = device
            .device_descriptor()
            .ok()
            .and_then(|d| handle.read_product_string_ascii(&d).ok())
            .unwrap_or_else(|| "unknown product".to_string());
        log::info!(
            "Opened {} (bus {:03} dev {:03}, IN {:#04x} OUT {:#04x})",
            product,
            device.bus_number(),
            device.address(),
            ep_in,
            ep_out
        );

        Ok(UsbTransport {
            handle,
            ep_in,
            ep_out,
            write_timeout: options.write_timeout,
            shutdown,
            rx: vec![0u8; RX_BUFFER],
            rx_start: 0,
            rx_end: 0,
        })
    }

    /// Block until at least one byte is buffered.
    fn fill(&mut self) -> Result<(), TransportError> {
        loop {
            if self.shutdown.is_requested() {
                return Err(TransportError::Shutdown);
            }
            match self.handle.read_bulk(self.ep_in, &mut self.rx, POLL_INTERVAL) {
                // zero-length packet
                Ok(0) => continue,
                Ok(n) => {
                    log::trace!("bulk IN {} bytes", n);
                    self.rx_start = 0;
                    self.rx_end = n;
                    return Ok(());
                }
                Err(rusb::Error::Timeout) => continue,
                Err(rusb::Error::NoDevice) => return Err(TransportError::Disconnected),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Transport for UsbTransport {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.rx_start == self.rx_end {
                self.fill()?;
            }
            let n = (self.rx_end - self.rx_start).min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&self.rx[self.rx_start..self.rx_start + n]);
            self.rx_start += n;
            filled += n;
        }
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut written = 0;
        while written < data.len() {
            match self
                .handle
                .write_bulk(self.ep_out, &data[written..], self.write_timeout)
            {
                Ok(0) => {
                    return Err(TransportError::ShortWrite {
                        written,
                        expected: data.len(),
                    })
                }
                Ok(n) => written += n,
                Err(rusb::Error::NoDevice) => return Err(TransportError::Disconnected),
                Err(e) => return Err(e.into()),
            }
        }
        log::trace!("bulk OUT {} bytes", written);
        Ok(())
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(INTERFACE);
    }
}
