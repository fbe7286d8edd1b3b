pub mod codec;
pub mod config;
pub mod dispatch;
pub mod drives;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod usb;

pub use config::Config;
pub use drives::DriveTable;
pub use error::{Error, FsError};
pub use session::{run, Termination};
pub use transport::{ShutdownHandle, Transport};
pub use usb::{UsbOptions, UsbTransport};

/// Validate `config`, connect to the client over USB and serve it until it
/// disconnects or `shutdown` is raised.
///
/// Configuration problems are reported before the USB bus is touched.
pub fn serve(
    config: &Config,
    options: &UsbOptions,
    shutdown: ShutdownHandle,
) -> Result<Termination, Error> {
    let drives = DriveTable::new(config)?;
    let transport = UsbTransport::open(options, shutdown)?;
    run(transport, &drives)
}
