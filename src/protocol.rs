use crate::error::ProtocolError;

/// Magic sentinels: first 4 bytes of every command / response header.
pub const COMMAND_MAGIC: [u8; 4] = *b"GLCI";
pub const RESPONSE_MAGIC: [u8; 4] = *b"GLCO";

/// Header layout (both directions): magic(4) + id/result(4) + payload length(4).
pub const HEADER_LEN: usize = 12;

/// Upper bound on a command payload, independent of file chunking.
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// Maximum bytes moved by a single read/write chunk.
pub const MAX_CHUNK: usize = 1024 * 1024;

/// Maximum number of transfer sessions open at the same time.
pub const MAX_SESSIONS: usize = 16;

/// Command IDs understood by the host.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    ListDrives = 0x01,
    GetDriveInfo = 0x02,
    StatPath = 0x03,
    ListDirectory = 0x04,
    GetFileCount = 0x05,
    GetFile = 0x06,
    GetDirectoryCount = 0x07,
    GetDirectory = 0x08,
    BeginReadFile = 0x09,
    ReadFileChunk = 0x0A,
    EndReadFile = 0x0B,
    BeginWriteFile = 0x0C,
    WriteFileChunk = 0x0D,
    EndWriteFile = 0x0E,
    CreateFile = 0x0F,
    CreateDirectory = 0x10,
    DeletePath = 0x11,
    RenamePath = 0x12,
    GetSpecialPathCount = 0x13,
    GetSpecialPath = 0x14,
    SelectFile = 0x15,
    CancelTransfer = 0x16,
    Disconnect = 0x17,
    SeekReadFile = 0x18,
}

impl TryFrom<u32> for CommandId {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use CommandId::*;
        Ok(match value {
            0x01 => ListDrives,
            0x02 => GetDriveInfo,
            0x03 => StatPath,
            0x04 => ListDirectory,
            0x05 => GetFileCount,
            0x06 => GetFile,
            0x07 => GetDirectoryCount,
            0x08 => GetDirectory,
            0x09 => BeginReadFile,
            0x0A => ReadFileChunk,
            0x0B => EndReadFile,
            0x0C => BeginWriteFile,
            0x0D => WriteFileChunk,
            0x0E => EndWriteFile,
            0x0F => CreateFile,
            0x10 => CreateDirectory,
            0x11 => DeletePath,
            0x12 => RenamePath,
            0x13 => GetSpecialPathCount,
            0x14 => GetSpecialPath,
            0x15 => SelectFile,
            0x16 => CancelTransfer,
            0x17 => Disconnect,
            0x18 => SeekReadFile,
            other => return Err(ProtocolError::UnknownCommand(other)),
        })
    }
}

/// Result codes carried in the response header. The first four values are
/// kept from the original Goldtree tool.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok = 0x0000,
    IoError = 0xBAF1,
    InvalidIndex = 0xBAF2,
    InvalidFileMode = 0xBAF3,
    SelectionCanceled = 0xBAF4,
    InvalidDrive = 0xBAF5,
    NoSuchPath = 0xBAF6,
    PathEscape = 0xBAF7,
    ReadOnlyDrive = 0xBAF8,
    NotADirectory = 0xBAF9,
    NotAFile = 0xBAFA,
    AlreadyExists = 0xBAFB,
    SessionClosed = 0xBAFC,
    IncompleteTransfer = 0xBAFD,
    TooManySessions = 0xBAFE,
    DeclaredSizeExceeded = 0xBAFF,
    UnknownCommand = 0xBB00,
    PayloadTooLarge = 0xBB01,
    MalformedPayload = 0xBB02,
    OffsetOutOfRange = 0xBB03,
}

impl ResultCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        use ResultCode::*;
        Some(match value {
            0x0000 => Ok,
            0xBAF1 => IoError,
            0xBAF2 => InvalidIndex,
            0xBAF3 => InvalidFileMode,
            0xBAF4 => SelectionCanceled,
            0xBAF5 => InvalidDrive,
            0xBAF6 => NoSuchPath,
            0xBAF7 => PathEscape,
            0xBAF8 => ReadOnlyDrive,
            0xBAF9 => NotADirectory,
            0xBAFA => NotAFile,
            0xBAFB => AlreadyExists,
            0xBAFC => SessionClosed,
            0xBAFD => IncompleteTransfer,
            0xBAFE => TooManySessions,
            0xBAFF => DeclaredSizeExceeded,
            0xBB00 => UnknownCommand,
            0xBB01 => PayloadTooLarge,
            0xBB02 => MalformedPayload,
            0xBB03 => OffsetOutOfRange,
            _ => return None,
        })
    }
}

/// Entry type reported by stat and listing commands.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    File = 1,
    Directory = 2,
}

/// What a drive index refers to on the host.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveKind {
    Directory = 0,
    SingleFile = 1,
}

/// Creation policy of `BeginWriteFile`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with `AlreadyExists` if the target is present.
    CreateNew = 1,
    /// Create or truncate the target.
    Overwrite = 2,
    /// Create the target if needed and add to its end. A failed upload
    /// truncates the file back to its previous length.
    Append = 3,
}

impl TryFrom<u32> for WriteMode {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(WriteMode::CreateNew),
            2 => Ok(WriteMode::Overwrite),
            3 => Ok(WriteMode::Append),
            other => Err(ProtocolError::InvalidFileMode(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire serialization helpers (all little-endian)
// ---------------------------------------------------------------------------

#[inline]
pub fn read_u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    let b = buf.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline]
pub fn read_u64_le(buf: &[u8], offset: usize) -> Option<u64> {
    let b = buf.get(offset..offset + 8)?;
    Some(u64::from_le_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

#[inline]
pub fn write_u32_le(buf: &mut Vec<u8>, val: u32) {
    buf.extend_from_slice(&val.to_le_bytes());
}

#[inline]
pub fn write_u64_le(buf: &mut Vec<u8>, val: u64) {
    buf.extend_from_slice(&val.to_le_bytes());
}

/// Sequential reader over a command payload.
///
/// Trailing bytes are tolerated: some clients pad commands to a fixed block.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        PayloadReader { buf, pos: 0 }
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        let val = read_u32_le(self.buf, self.pos).ok_or(ProtocolError::Malformed("u32"))?;
        self.pos += 4;
        Ok(val)
    }

    pub fn u64(&mut self) -> Result<u64, ProtocolError> {
        let val = read_u64_le(self.buf, self.pos).ok_or(ProtocolError::Malformed("u64"))?;
        self.pos += 8;
        Ok(val)
    }

    /// Length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u32()? as usize;
        let bytes = self
            .buf
            .get(self.pos..self.pos.saturating_add(len))
            .ok_or(ProtocolError::Malformed("string length"))?;
        let s = std::str::from_utf8(bytes).map_err(|_| ProtocolError::Malformed("string utf-8"))?;
        self.pos += len;
        Ok(s.to_owned())
    }

    /// Drive index followed by a drive-relative path.
    pub fn path(&mut self) -> Result<(u32, String), ProtocolError> {
        let drive = self.u32()?;
        let relative = self.string()?;
        Ok((drive, relative))
    }

    /// Everything not consumed yet.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        rest
    }
}

/// Builder for response payloads.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        PayloadWriter::default()
    }

    pub fn u32(&mut self, val: u32) -> &mut Self {
        write_u32_le(&mut self.buf, val);
        self
    }

    pub fn u64(&mut self, val: u64) -> &mut Self {
        write_u64_le(&mut self.buf, val);
        self
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        // Strings longer than u32::MAX cannot come out of a host path.
        write_u32_le(&mut self.buf, s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    pub fn path(&mut self, drive: u32, relative: &str) -> &mut Self {
        self.u32(drive).string(relative)
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}
