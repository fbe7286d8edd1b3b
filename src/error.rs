use std::io;
use std::path::PathBuf;

use crate::protocol::ResultCode;

/// Failure raised by a transport adapter. Always fatal to the session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// USB I/O error during operation
    #[error("USB I/O error: {0}")]
    Usb(#[from] rusb::Error),
    /// The client went away (device unplugged or stream ended)
    #[error("client disconnected")]
    Disconnected,
    /// A bulk write made no progress
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    /// Stop requested through a `ShutdownHandle`
    #[error("shutdown requested")]
    Shutdown,
}

/// Errors that end a session or prevent it from starting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Client device not found on USB bus
    #[error("client device not found (VID:{vendor_id:04X} PID:{product_id:04X})")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },
    /// USB open/claim error
    #[error("USB open error: {0}")]
    UsbOpen(rusb::Error),
    /// The claimed interface has no bulk IN/OUT endpoint pair
    #[error("no bulk endpoints on interface {0}")]
    NoBulkEndpoints(u8),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Magic sentinel mismatch; the stream has lost byte alignment
    #[error("bad magic {0:02X?}, stream desynchronized")]
    BadMagic([u8; 4]),
    /// Response header from the host side could not be parsed
    #[error("bad response result code {0:#06X}")]
    BadResultCode(u32),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Invalid startup configuration, reported before the command loop starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("drive path {}: {source}", path.display())]
    DrivePath { path: PathBuf, source: io::Error },
    #[error("drive path {} is not a directory", path.display())]
    DriveNotADirectory { path: PathBuf },
    #[error("selected file {}: {source}", path.display())]
    SelectedFile { path: PathBuf, source: io::Error },
    #[error("selected file {} is not a regular file", path.display())]
    SelectedNotAFile { path: PathBuf },
}

// ---------------------------------------------------------------------------
// Handler-level taxonomy: turned into error responses, the session continues
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(#[from] NotFound),
    #[error("security: {0}")]
    Security(#[from] Security),
    #[error("invalid state: {0}")]
    InvalidState(#[from] InvalidState),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("declared size exceeded: {declared} bytes declared, {attempted} attempted")]
    Overflow { declared: u64, attempted: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NotFound {
    #[error("no drive with index {0}")]
    InvalidDrive(u32),
    #[error("no such path {0:?}")]
    NoSuchPath(String),
    #[error("index {0} out of range")]
    InvalidIndex(u32),
    #[error("no file selected")]
    NoSelection,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Security {
    #[error("path escapes its drive root")]
    PathEscape,
    #[error("drive or drive root is read-only")]
    ReadOnlyDrive,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidState {
    #[error("not a directory")]
    NotADirectory,
    #[error("not a regular file")]
    NotAFile,
    #[error("already exists")]
    AlreadyExists,
    #[error("transfer session {0} is closed")]
    SessionClosed(u32),
    #[error("transfer incomplete, {remaining} bytes missing")]
    IncompleteTransfer { remaining: u64 },
    #[error("too many open transfer sessions")]
    TooManySessions,
    #[error("offset {offset} is past the end of a {total}-byte file")]
    OffsetOutOfRange { offset: u64, total: u64 },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown command {0:#x}")]
    UnknownCommand(u32),
    #[error("payload of {length} bytes exceeds limit of {limit}")]
    PayloadTooLarge { length: usize, limit: usize },
    #[error("malformed payload ({0})")]
    Malformed(&'static str),
    #[error("invalid file mode {0}")]
    InvalidFileMode(u32),
}

impl FsError {
    /// Wire result code for this failure.
    pub fn result_code(&self) -> ResultCode {
        match self {
            FsError::NotFound(NotFound::InvalidDrive(_)) => ResultCode::InvalidDrive,
            FsError::NotFound(NotFound::NoSuchPath(_)) => ResultCode::NoSuchPath,
            FsError::NotFound(NotFound::InvalidIndex(_)) => ResultCode::InvalidIndex,
            FsError::NotFound(NotFound::NoSelection) => ResultCode::SelectionCanceled,
            FsError::Security(Security::PathEscape) => ResultCode::PathEscape,
            FsError::Security(Security::ReadOnlyDrive) => ResultCode::ReadOnlyDrive,
            FsError::InvalidState(InvalidState::NotADirectory) => ResultCode::NotADirectory,
            FsError::InvalidState(InvalidState::NotAFile) => ResultCode::NotAFile,
            FsError::InvalidState(InvalidState::AlreadyExists) => ResultCode::AlreadyExists,
            FsError::InvalidState(InvalidState::SessionClosed(_)) => ResultCode::SessionClosed,
            FsError::InvalidState(InvalidState::IncompleteTransfer { .. }) => {
                ResultCode::IncompleteTransfer
            }
            FsError::InvalidState(InvalidState::TooManySessions) => ResultCode::TooManySessions,
            FsError::InvalidState(InvalidState::OffsetOutOfRange { .. }) => {
                ResultCode::OffsetOutOfRange
            }
            FsError::Protocol(ProtocolError::UnknownCommand(_)) => ResultCode::UnknownCommand,
            FsError::Protocol(ProtocolError::PayloadTooLarge { .. }) => ResultCode::PayloadTooLarge,
            FsError::Protocol(ProtocolError::Malformed(_)) => ResultCode::MalformedPayload,
            FsError::Protocol(ProtocolError::InvalidFileMode(_)) => ResultCode::InvalidFileMode,
            FsError::Overflow { .. } => ResultCode::DeclaredSizeExceeded,
            FsError::Io(_) => ResultCode::IoError,
        }
    }
}

/// Attach the client-visible path to an `io::Error` so that missing entries
/// and collisions map onto their own result codes instead of `IoError`.
pub trait IoResultExt<T> {
    fn at(self, relative: &str) -> Result<T, FsError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, relative: &str) -> Result<T, FsError> {
        self.map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => NotFound::NoSuchPath(relative.to_owned()).into(),
            io::ErrorKind::AlreadyExists => InvalidState::AlreadyExists.into(),
            _ => FsError::Io(err),
        })
    }
}
