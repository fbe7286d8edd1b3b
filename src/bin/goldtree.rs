use std::path::PathBuf;
use std::process;
use std::time::Duration;

use goldtree::usb::{DEFAULT_WRITE_TIMEOUT, GOLDLEAF_PID, GOLDLEAF_VID};
use goldtree::{Config, ShutdownHandle, Termination, UsbOptions};

#[derive(argh::FromArgs, Debug)]
/** Serve host directories to a Goldleaf client over USB.

RUST_LOG=info shows protocol activity, RUST_LOG=debug every command.
 */
struct Args {
    #[argh(option, short = 'f')]
    /// file offered to the client's file picker
    selected_file: Option<PathBuf>,

    #[argh(option, from_str_fn(parse_id))]
    /// USB vendor id (default 0x057E)
    vid: Option<u16>,

    #[argh(option, from_str_fn(parse_id))]
    /// USB product id (default 0x3000)
    pid: Option<u16>,

    #[argh(option)]
    /// bulk write timeout in milliseconds (default 3000)
    write_timeout_ms: Option<u64>,

    #[argh(switch)]
    /// do not offer Desktop and Documents shortcuts
    no_special_paths: bool,

    #[argh(positional)]
    /// directories to expose as drives, in order
    paths: Vec<PathBuf>,
}

/// Hex with or without `0x`; a leading `#` marks decimal.
fn parse_id(value: &str) -> Result<u16, String> {
    let parsed = match value.strip_prefix('#') {
        Some(decimal) => decimal.parse::<u16>(),
        None => {
            let hex = value
                .strip_prefix("0x")
                .or_else(|| value.strip_prefix("0X"))
                .unwrap_or(value);
            u16::from_str_radix(hex, 16)
        }
    };
    parsed.map_err(|e| format!("invalid USB id {value:?}: {e}"))
}

/// `serve` looks for the device once and fails if it is absent.
fn connect_banner(options: &UsbOptions) -> String {
    format!(
        "==> Connecting to client (VID:{:04X} PID:{:04X})...",
        options.vendor_id, options.product_id
    )
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let mut config = Config::from_args(args.selected_file, args.paths);
    if args.no_special_paths {
        config = config.without_special_paths();
    }
    if config.drives.is_empty() && config.selected_file.is_none() {
        eprintln!("Usage: goldtree [OPTIONS] <DIR>...");
        eprintln!("       goldtree --help for more info");
        process::exit(1);
    }

    let options = UsbOptions {
        vendor_id: args.vid.unwrap_or(GOLDLEAF_VID),
        product_id: args.pid.unwrap_or(GOLDLEAF_PID),
        write_timeout: args
            .write_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_WRITE_TIMEOUT),
    };

    eprintln!("{}", connect_banner(&options));
    // No signal handler is installed; Ctrl-C ends the process directly and
    // the OS releases the device.
    let shutdown = ShutdownHandle::new();

    match goldtree::serve(&config, &options, shutdown) {
        Ok(Termination::Disconnected) => eprintln!("==> Client disconnected"),
        Ok(Termination::Shutdown) => eprintln!("==> Stopped"),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}
