//! Chunked file transfers.
//!
//! A transfer session owns one open host file. Reads and writes move at most
//! `MAX_CHUNK` bytes per command, so memory use stays bounded no matter how
//! large the file is.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::drives::DriveTable;
use crate::error::{FsError, InvalidState, IoResultExt, ProtocolError};
use crate::protocol::{WriteMode, MAX_CHUNK, MAX_SESSIONS};

struct ReadSession {
    file: File,
    total: u64,
    offset: u64,
}

impl ReadSession {
    fn remaining(&self) -> u64 {
        self.total - self.offset
    }
}

/// What an abandoned upload leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discard {
    /// The file was created or truncated by this upload.
    Remove,
    /// The upload appended to a file of this length.
    TruncateTo(u64),
}

/// An in-progress upload. Dropping it before `finish` undoes it so a partial
/// file never looks complete.
struct WriteSession {
    file: Option<File>,
    path: PathBuf,
    declared: u64,
    written: u64,
    discard: Discard,
    finished: bool,
}

impl WriteSession {
    fn remaining(&self) -> u64 {
        self.declared - self.written
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("write session already closed"))?;
        file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn finish(mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        self.finished = true;
        Ok(())
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Close before removing; some platforms refuse to unlink open files.
        drop(self.file.take());
        let undone = match self.discard {
            Discard::Remove => fs::remove_file(&self.path),
            Discard::TruncateTo(len) => OpenOptions::new()
                .write(true)
                .open(&self.path)
                .and_then(|f| f.set_len(len)),
        };
        match undone {
            Ok(()) => log::info!(
                "discarded partial upload {} ({} of {} bytes)",
                self.path.display(),
                self.written,
                self.declared
            ),
            Err(err) => log::warn!("could not discard partial upload {}: {}", self.path.display(), err),
        }
    }
}

/// Open transfer sessions, keyed by the id handed to the client.
pub struct TransferEngine {
    next_id: u32,
    reads: HashMap<u32, ReadSession>,
    writes: HashMap<u32, WriteSession>,
}

impl Default for TransferEngine {
    fn default() -> Self {
        TransferEngine::new()
    }
}

impl TransferEngine {
    pub fn new() -> Self {
        TransferEngine {
            next_id: 1, // start at 1 so 0 is never a valid session
            reads: HashMap::new(),
            writes: HashMap::new(),
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.reads.len() + self.writes.len()
    }

    fn check_capacity(&self) -> Result<(), FsError> {
        if self.open_sessions() >= MAX_SESSIONS {
            return Err(InvalidState::TooManySessions.into());
        }
        Ok(())
    }

    /// Ids are only handed out once the file is open, so a failed begin
    /// never burns one.
    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        id
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    /// Open a file for chunked reading. Returns the session id and file size.
    pub fn begin_read(
        &mut self,
        drives: &DriveTable,
        drive: u32,
        relative: &str,
    ) -> Result<(u32, u64), FsError> {
        self.check_capacity()?;
        let path = drives.resolve(drive, relative)?;
        let file = File::open(&path).at(relative)?;
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(InvalidState::NotAFile.into());
        }

        let id = self.alloc_id();
        let total = meta.len();
        log::info!("READ #{} {} ({} bytes)", id, path.display(), total);
        self.reads.insert(
            id,
            ReadSession {
                file,
                total,
                offset: 0,
            },
        );
        Ok((id, total))
    }

    /// Next `min(requested, remaining, MAX_CHUNK)` bytes of the file.
    ///
    /// Once every byte has been delivered further reads fail with
    /// `SessionClosed` until `seek_read` moves back; the session still has
    /// to be ended explicitly.
    /// A read error tears the session down.
    pub fn read_chunk(&mut self, id: u32, requested: u32) -> Result<Vec<u8>, FsError> {
        let session = self
            .reads
            .get_mut(&id)
            .ok_or(InvalidState::SessionClosed(id))?;
        let remaining = session.remaining();
        if remaining == 0 {
            return Err(InvalidState::SessionClosed(id).into());
        }

        let len = u64::from(requested).min(remaining).min(MAX_CHUNK as u64) as usize;
        let mut buf = vec![0u8; len];
        if let Err(err) = session.file.read_exact(&mut buf) {
            log::warn!("READ #{} failed at offset {}: {}", id, session.offset, err);
            self.reads.remove(&id);
            return Err(FsError::Io(err));
        }
        session.offset += len as u64;
        log::debug!("READ #{} {} bytes, {} left", id, len, session.remaining());
        Ok(buf)
    }

    /// Move the read position of a session. `offset` may equal the file size,
    /// which leaves nothing to read.
    pub fn seek_read(&mut self, id: u32, offset: u64) -> Result<(), FsError> {
        let session = self
            .reads
            .get_mut(&id)
            .ok_or(InvalidState::SessionClosed(id))?;
        if offset > session.total {
            return Err(InvalidState::OffsetOutOfRange {
                offset,
                total: session.total,
            }
            .into());
        }

        if let Err(err) = session.file.seek(SeekFrom::Start(offset)) {
            log::warn!("SEEK #{} to {} failed: {}", id, offset, err);
            self.reads.remove(&id);
            return Err(FsError::Io(err));
        }
        session.offset = offset;
        log::debug!("SEEK #{} to {}, {} left", id, offset, session.remaining());
        Ok(())
    }

    pub fn end_read(&mut self, id: u32) -> Result<(), FsError> {
        let session = self
            .reads
            .remove(&id)
            .ok_or(InvalidState::SessionClosed(id))?;
        log::debug!("END READ #{} at {}/{}", id, session.offset, session.total);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Create, truncate or append to a file (per `mode`) that will receive
    /// exactly `declared` more bytes.
    pub fn begin_write(
        &mut self,
        drives: &DriveTable,
        drive: u32,
        relative: &str,
        declared: u64,
        mode: WriteMode,
    ) -> Result<u32, FsError> {
        let path = drives.resolve_for_update(drive, relative)?;
        if path.is_dir() {
            return Err(InvalidState::NotAFile.into());
        }

        self.check_capacity()?;
        let mut opts = OpenOptions::new();
        let discard = match mode {
            WriteMode::CreateNew => {
                opts.write(true).create_new(true);
                Discard::Remove
            }
            WriteMode::Overwrite => {
                opts.write(true).create(true).truncate(true);
                Discard::Remove
            }
            WriteMode::Append => {
                opts.append(true).create(true);
                match fs::metadata(&path) {
                    Ok(meta) => Discard::TruncateTo(meta.len()),
                    Err(_) => Discard::Remove,
                }
            }
        };
        let file = opts.open(&path).at(relative)?;

        let id = self.alloc_id();
        log::info!("WRITE #{} {} ({} bytes, {:?})", id, path.display(), declared, mode);
        self.writes.insert(
            id,
            WriteSession {
                file: Some(file),
                path,
                declared,
                written: 0,
                discard,
                finished: false,
            },
        );
        Ok(id)
    }

    /// Append a chunk; returns the bytes still expected.
    ///
    /// Exceeding the declared size, or an I/O failure, ends the session and
    /// undoes the upload.
    pub fn write_chunk(&mut self, id: u32, data: &[u8]) -> Result<u64, FsError> {
        if data.len() > MAX_CHUNK {
            return Err(ProtocolError::PayloadTooLarge {
                length: data.len(),
                limit: MAX_CHUNK,
            }
            .into());
        }
        let session = self
            .writes
            .get_mut(&id)
            .ok_or(InvalidState::SessionClosed(id))?;

        let attempted = session.written + data.len() as u64;
        if attempted > session.declared {
            let declared = session.declared;
            log::warn!("WRITE #{} overflow: {} > {}", id, attempted, declared);
            self.writes.remove(&id);
            return Err(FsError::Overflow {
                declared,
                attempted,
            });
        }

        if let Err(err) = session.write(data) {
            log::warn!("WRITE #{} failed: {}", id, err);
            self.writes.remove(&id);
            return Err(FsError::Io(err));
        }
        log::debug!("WRITE #{} {} bytes, {} left", id, data.len(), session.remaining());
        Ok(session.remaining())
    }

    /// Close a write session. Fails with `IncompleteTransfer` and undoes the
    /// upload unless exactly the declared size was written.
    pub fn end_write(&mut self, id: u32) -> Result<(), FsError> {
        let session = self
            .writes
            .remove(&id)
            .ok_or(InvalidState::SessionClosed(id))?;

        let remaining = session.remaining();
        if remaining != 0 {
            log::warn!("END WRITE #{} with {} bytes missing", id, remaining);
            return Err(InvalidState::IncompleteTransfer { remaining }.into());
        }

        let path = session.path.clone();
        session.finish()?;
        log::info!("END WRITE #{} {}", id, path.display());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Abort one session, read or write.
    pub fn cancel(&mut self, id: u32) -> Result<(), FsError> {
        if self.reads.remove(&id).is_some() || self.writes.remove(&id).is_some() {
            log::info!("CANCEL #{}", id);
            Ok(())
        } else {
            Err(InvalidState::SessionClosed(id).into())
        }
    }

    /// Drop every open session; unfinished uploads are removed.
    pub fn abort_all(&mut self) {
        if self.open_sessions() > 0 {
            log::info!(
                "aborting {} read and {} write sessions",
                self.reads.len(),
                self.writes.len()
            );
        }
        self.reads.clear();
        self.writes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::Security;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, DriveTable) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello, world!").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let table =
            DriveTable::new(&Config::new(vec![dir.path().to_path_buf()]).without_special_paths())
                .unwrap();
        (dir, table)
    }

    fn session_closed(result: Result<impl std::fmt::Debug, FsError>) -> bool {
        matches!(result, Err(FsError::InvalidState(InvalidState::SessionClosed(_))))
    }

    #[test]
    fn reads_in_bounded_chunks() {
        let (_dir, drives) = fixture();
        let mut engine = TransferEngine::new();

        let (id, total) = engine.begin_read(&drives, 0, "notes.txt").unwrap();
        assert_eq!(total, 13);
        assert_eq!(engine.read_chunk(id, 8).unwrap(), b"hello, w");
        assert_eq!(engine.read_chunk(id, 8).unwrap(), b"orld!");
        assert!(session_closed(engine.read_chunk(id, 8)));
        engine.end_read(id).unwrap();
        assert!(session_closed(engine.read_chunk(id, 1)));
        assert!(session_closed(engine.end_read(id)));
    }

    #[test]
    fn oversized_request_returns_exactly_what_remains() {
        let (_dir, drives) = fixture();
        let mut engine = TransferEngine::new();
        let (id, _) = engine.begin_read(&drives, 0, "notes.txt").unwrap();
        assert_eq!(engine.read_chunk(id, u32::MAX).unwrap().len(), 13);
        assert!(session_closed(engine.read_chunk(id, 1)));
    }

    #[test]
    fn begin_read_follows_drive_rules() {
        let (_dir, drives) = fixture();
        let mut engine = TransferEngine::new();
        assert!(matches!(
            engine.begin_read(&drives, 0, "../notes.txt"),
            Err(FsError::Security(Security::PathEscape))
        ));
        assert_eq!(
            engine.begin_read(&drives, 0, "missing").unwrap_err().result_code(),
            crate::protocol::ResultCode::NoSuchPath
        );
        assert!(matches!(
            engine.begin_read(&drives, 0, "sub"),
            Err(FsError::InvalidState(InvalidState::NotAFile)) | Err(FsError::Io(_))
        ));
        assert_eq!(engine.open_sessions(), 0);
    }

    #[test]
    fn write_then_read_back() {
        let (dir, drives) = fixture();
        let mut engine = TransferEngine::new();
        let data: Vec<u8> = (0..(MAX_CHUNK + 1)).map(|i| (i % 251) as u8).collect();

        let id = engine
            .begin_write(&drives, 0, "sub/blob.bin", data.len() as u64, WriteMode::CreateNew)
            .unwrap();
        assert_eq!(engine.write_chunk(id, &data[..MAX_CHUNK]).unwrap(), 1);
        assert_eq!(engine.write_chunk(id, &data[MAX_CHUNK..]).unwrap(), 0);
        engine.end_write(id).unwrap();

        assert_eq!(fs::read(dir.path().join("sub/blob.bin")).unwrap(), data);
    }

    #[test]
    fn overflow_removes_destination() {
        let (dir, drives) = fixture();
        let mut engine = TransferEngine::new();
        let id = engine
            .begin_write(&drives, 0, "out.bin", 4, WriteMode::CreateNew)
            .unwrap();
        engine.write_chunk(id, b"abc").unwrap();
        assert!(matches!(
            engine.write_chunk(id, b"de"),
            Err(FsError::Overflow {
                declared: 4,
                attempted: 5
            })
        ));
        assert!(!dir.path().join("out.bin").exists());
        assert!(session_closed(engine.write_chunk(id, b"d")));
    }

    #[test]
    fn incomplete_write_is_removed() {
        let (dir, drives) = fixture();
        let mut engine = TransferEngine::new();
        let id = engine
            .begin_write(&drives, 0, "half.bin", 10, WriteMode::Overwrite)
            .unwrap();
        engine.write_chunk(id, b"12345").unwrap();
        assert!(matches!(
            engine.end_write(id),
            Err(FsError::InvalidState(InvalidState::IncompleteTransfer { remaining: 5 }))
        ));
        assert!(!dir.path().join("half.bin").exists());
    }

    #[test]
    fn create_new_refuses_existing_file() {
        let (dir, drives) = fixture();
        let mut engine = TransferEngine::new();
        assert!(matches!(
            engine.begin_write(&drives, 0, "notes.txt", 1, WriteMode::CreateNew),
            Err(FsError::InvalidState(InvalidState::AlreadyExists))
        ));
        assert_eq!(fs::read(dir.path().join("notes.txt")).unwrap(), b"hello, world!");

        let id = engine
            .begin_write(&drives, 0, "notes.txt", 2, WriteMode::Overwrite)
            .unwrap();
        engine.write_chunk(id, b"hi").unwrap();
        engine.end_write(id).unwrap();
        assert_eq!(fs::read(dir.path().join("notes.txt")).unwrap(), b"hi");
    }

    #[test]
    fn cancel_and_abort_discard_uploads() {
        let (dir, drives) = fixture();
        let mut engine = TransferEngine::new();

        let a = engine.begin_write(&drives, 0, "a.bin", 8, WriteMode::CreateNew).unwrap();
        engine.write_chunk(a, b"1234").unwrap();
        engine.cancel(a).unwrap();
        assert!(!dir.path().join("a.bin").exists());
        assert!(session_closed(engine.cancel(a)));

        let b = engine.begin_write(&drives, 0, "b.bin", 8, WriteMode::CreateNew).unwrap();
        let (r, _) = engine.begin_read(&drives, 0, "notes.txt").unwrap();
        assert_ne!(b, r);
        engine.abort_all();
        assert_eq!(engine.open_sessions(), 0);
        assert!(!dir.path().join("b.bin").exists());
    }

    #[test]
    fn session_count_is_bounded() {
        let (_dir, drives) = fixture();
        let mut engine = TransferEngine::new();
        for _ in 0..MAX_SESSIONS {
            engine.begin_read(&drives, 0, "notes.txt").unwrap();
        }
        assert!(matches!(
            engine.begin_read(&drives, 0, "notes.txt"),
            Err(FsError::InvalidState(InvalidState::TooManySessions))
        ));
    }

    #[test]
    fn seek_moves_the_read_position() {
        let (_dir, drives) = fixture();
        let mut engine = TransferEngine::new();
        let (id, _) = engine.begin_read(&drives, 0, "notes.txt").unwrap();

        engine.seek_read(id, 7).unwrap();
        assert_eq!(engine.read_chunk(id, 64).unwrap(), b"world!");
        assert!(session_closed(engine.read_chunk(id, 1)));

        engine.seek_read(id, 0).unwrap();
        assert_eq!(engine.read_chunk(id, 5).unwrap(), b"hello");

        engine.seek_read(id, 13).unwrap();
        assert!(session_closed(engine.read_chunk(id, 1)));
        assert!(matches!(
            engine.seek_read(id, 14),
            Err(FsError::InvalidState(InvalidState::OffsetOutOfRange {
                offset: 14,
                total: 13
            }))
        ));
        assert!(session_closed(engine.seek_read(99, 0)));
        engine.end_read(id).unwrap();
    }

    #[test]
    fn file_shrinking_mid_read_tears_the_session_down() {
        let (dir, drives) = fixture();
        let path = dir.path().join("sub/big.bin");
        fs::write(&path, vec![7u8; 64]).unwrap();
        let mut engine = TransferEngine::new();

        let (id, total) = engine.begin_read(&drives, 0, "sub/big.bin").unwrap();
        assert_eq!(total, 64);
        assert_eq!(engine.read_chunk(id, 8).unwrap().len(), 8);

        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(20)
            .unwrap();
        let err = engine.read_chunk(id, 32).unwrap_err();
        assert_eq!(err.result_code(), crate::protocol::ResultCode::IoError);
        assert!(session_closed(engine.read_chunk(id, 1)));
        assert_eq!(engine.open_sessions(), 0);
    }

    #[test]
    fn failed_write_removes_destination() {
        let (dir, _drives) = fixture();
        let path = dir.path().join("sub/readonly.bin");
        fs::write(&path, b"").unwrap();
        let mut engine = TransferEngine::new();

        // A handle opened for reading makes every write fail.
        let id = engine.alloc_id();
        engine.writes.insert(
            id,
            WriteSession {
                file: Some(File::open(&path).unwrap()),
                path: path.clone(),
                declared: 4,
                written: 0,
                discard: Discard::Remove,
                finished: false,
            },
        );

        let err = engine.write_chunk(id, b"data").unwrap_err();
        assert!(matches!(err, FsError::Io(_)));
        assert_eq!(engine.open_sessions(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn append_adds_to_the_end() {
        let (dir, drives) = fixture();
        let mut engine = TransferEngine::new();

        let id = engine
            .begin_write(&drives, 0, "notes.txt", 3, WriteMode::Append)
            .unwrap();
        assert_eq!(engine.write_chunk(id, b" :)").unwrap(), 0);
        engine.end_write(id).unwrap();
        assert_eq!(fs::read(dir.path().join("notes.txt")).unwrap(), b"hello, world! :)");

        let id = engine
            .begin_write(&drives, 0, "sub/new.log", 2, WriteMode::Append)
            .unwrap();
        engine.write_chunk(id, b"ok").unwrap();
        engine.end_write(id).unwrap();
        assert_eq!(fs::read(dir.path().join("sub/new.log")).unwrap(), b"ok");
    }

    #[test]
    fn failed_append_restores_previous_length() {
        let (dir, drives) = fixture();
        let notes = dir.path().join("notes.txt");
        let mut engine = TransferEngine::new();

        let id = engine
            .begin_write(&drives, 0, "notes.txt", 4, WriteMode::Append)
            .unwrap();
        engine.write_chunk(id, b"abc").unwrap();
        assert!(matches!(
            engine.write_chunk(id, b"de"),
            Err(FsError::Overflow { .. })
        ));
        assert_eq!(fs::read(&notes).unwrap(), b"hello, world!");

        let id = engine
            .begin_write(&drives, 0, "notes.txt", 4, WriteMode::Append)
            .unwrap();
        engine.write_chunk(id, b"ab").unwrap();
        engine.cancel(id).unwrap();
        assert_eq!(fs::read(&notes).unwrap(), b"hello, world!");

        // A file the upload created is removed instead.
        let id = engine
            .begin_write(&drives, 0, "fresh.log", 4, WriteMode::Append)
            .unwrap();
        engine.write_chunk(id, b"ab").unwrap();
        assert!(engine.end_write(id).is_err());
        assert!(!dir.path().join("fresh.log").exists());
    }
}
