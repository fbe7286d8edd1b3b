use crate::drives::DriveTable;
use crate::error::{FsError, NotFound};
use crate::protocol::{CommandId, PayloadReader, PayloadWriter, WriteMode};
use crate::transfer::TransferEngine;

/// Decodes command payloads, runs them against the drive table and transfer
/// engine, and encodes the response payload.
pub struct Dispatcher<'a> {
    drives: &'a DriveTable,
    transfers: TransferEngine,
}

impl<'a> Dispatcher<'a> {
    pub fn new(drives: &'a DriveTable) -> Self {
        Dispatcher {
            drives,
            transfers: TransferEngine::new(),
        }
    }

    pub fn transfers(&self) -> &TransferEngine {
        &self.transfers
    }

    /// Release every open transfer; unfinished uploads are removed.
    pub fn abort_transfers(&mut self) {
        self.transfers.abort_all();
    }

    // -----------------------------------------------------------------------
    // Top-level dispatch
    // -----------------------------------------------------------------------

    /// Run one command and return the payload of its `Ok` response.
    pub fn handle(&mut self, command: CommandId, payload: &[u8]) -> Result<Vec<u8>, FsError> {
        log::debug!("{:?} ({} bytes)", command, payload.len());

        let mut input = PayloadReader::new(payload);
        let mut out = PayloadWriter::new();

        match command {
            CommandId::ListDrives => self.list_drives(&mut out),
            CommandId::GetDriveInfo => self.get_drive_info(&mut input, &mut out),
            CommandId::StatPath => self.stat_path(&mut input, &mut out),
            CommandId::ListDirectory => self.list_directory(&mut input, &mut out),
            CommandId::GetFileCount => self.get_file_count(&mut input, &mut out),
            CommandId::GetFile => self.get_file(&mut input, &mut out),
            CommandId::GetDirectoryCount => self.get_directory_count(&mut input, &mut out),
            CommandId::GetDirectory => self.get_directory(&mut input, &mut out),
            CommandId::BeginReadFile => self.begin_read_file(&mut input, &mut out),
            CommandId::ReadFileChunk => self.read_file_chunk(&mut input, &mut out),
            CommandId::EndReadFile => self.end_read_file(&mut input),
            CommandId::SeekReadFile => self.seek_read_file(&mut input),
            CommandId::BeginWriteFile => self.begin_write_file(&mut input, &mut out),
            CommandId::WriteFileChunk => self.write_file_chunk(&mut input, &mut out),
            CommandId::EndWriteFile => self.end_write_file(&mut input),
            CommandId::CreateFile => self.create_file(&mut input),
            CommandId::CreateDirectory => self.create_directory(&mut input),
            CommandId::DeletePath => self.delete_path(&mut input),
            CommandId::RenamePath => self.rename_path(&mut input),
            CommandId::GetSpecialPathCount => self.get_special_path_count(&mut out),
            CommandId::GetSpecialPath => self.get_special_path(&mut input, &mut out),
            CommandId::SelectFile => self.select_file(&mut out),
            CommandId::CancelTransfer => self.cancel_transfer(&mut input),
            // Acknowledged with an empty payload; the session closes afterwards.
            CommandId::Disconnect => Ok(()),
        }?;

        Ok(out.finish())
    }

    // -----------------------------------------------------------------------
    // Drives
    // -----------------------------------------------------------------------

    // Out: u32 count, count * (u32 index, string label, u32 kind)
    fn list_drives(&self, out: &mut PayloadWriter) -> Result<(), FsError> {
        let drives = self.drives.drives();
        out.u32(drives.len() as u32);
        for drive in drives {
            out.u32(drive.index)
                .string(&drive.label)
                .u32(drive.kind as u32);
        }
        Ok(())
    }

    // In: u32 index
    // Out: string label, string prefix, u64 total space, u64 free space
    fn get_drive_info(&self, input: &mut PayloadReader, out: &mut PayloadWriter) -> Result<(), FsError> {
        let index = input.u32()?;
        let drive = self.drives.drive(index)?;
        // Space figures are not reported; 0 means unknown to the client.
        out.string(&drive.label).string(&drive.prefix()).u64(0).u64(0);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Metadata and listing
    // -----------------------------------------------------------------------

    // In: path
    // Out: u32 type, u64 size, u64 mtime
    fn stat_path(&self, input: &mut PayloadReader, out: &mut PayloadWriter) -> Result<(), FsError> {
        let (drive, relative) = input.path()?;
        let stat = self.drives.stat(drive, &relative)?;
        out.u32(stat.kind as u32).u64(stat.size).u64(stat.modified);
        Ok(())
    }

    // In: path
    // Out: u32 count, count * (string name, u32 type, u64 size, u64 mtime)
    fn list_directory(&self, input: &mut PayloadReader, out: &mut PayloadWriter) -> Result<(), FsError> {
        let (drive, relative) = input.path()?;
        let entries = self.drives.list_entries(drive, &relative)?;
        out.u32(entries.len() as u32);
        for entry in &entries {
            out.string(&entry.name)
                .u32(entry.stat.kind as u32)
                .u64(entry.stat.size)
                .u64(entry.stat.modified);
        }
        Ok(())
    }

    fn get_file_count(&self, input: &mut PayloadReader, out: &mut PayloadWriter) -> Result<(), FsError> {
        let (drive, relative) = input.path()?;
        out.u32(self.drives.files(drive, &relative)?.len() as u32);
        Ok(())
    }

    // In: path, u32 index
    fn get_file(&self, input: &mut PayloadReader, out: &mut PayloadWriter) -> Result<(), FsError> {
        let (drive, relative) = input.path()?;
        let index = input.u32()?;
        let files = self.drives.files(drive, &relative)?;
        let name = files
            .get(index as usize)
            .ok_or(NotFound::InvalidIndex(index))?;
        out.string(name);
        Ok(())
    }

    fn get_directory_count(&self, input: &mut PayloadReader, out: &mut PayloadWriter) -> Result<(), FsError> {
        let (drive, relative) = input.path()?;
        out.u32(self.drives.directories(drive, &relative)?.len() as u32);
        Ok(())
    }

    // In: path, u32 index
    fn get_directory(&self, input: &mut PayloadReader, out: &mut PayloadWriter) -> Result<(), FsError> {
        let (drive, relative) = input.path()?;
        let index = input.u32()?;
        let dirs = self.drives.directories(drive, &relative)?;
        let name = dirs
            .get(index as usize)
            .ok_or(NotFound::InvalidIndex(index))?;
        out.string(name);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transfers
    // -----------------------------------------------------------------------

    // In: path
    // Out: u32 session, u64 total size
    fn begin_read_file(&mut self, input: &mut PayloadReader, out: &mut PayloadWriter) -> Result<(), FsError> {
        let (drive, relative) = input.path()?;
        let (id, total) = self.transfers.begin_read(self.drives, drive, &relative)?;
        out.u32(id).u64(total);
        Ok(())
    }

    // In: u32 session, u32 requested length
    // Out: raw file bytes
    fn read_file_chunk(&mut self, input: &mut PayloadReader, out: &mut PayloadWriter) -> Result<(), FsError> {
        let id = input.u32()?;
        let requested = input.u32()?;
        out.bytes(&self.transfers.read_chunk(id, requested)?);
        Ok(())
    }

    fn end_read_file(&mut self, input: &mut PayloadReader) -> Result<(), FsError> {
        let id = input.u32()?;
        self.transfers.end_read(id)
    }

    // In: u32 session, u64 offset
    fn seek_read_file(&mut self, input: &mut PayloadReader) -> Result<(), FsError> {
        let id = input.u32()?;
        let offset = input.u64()?;
        self.transfers.seek_read(id, offset)
    }

    // In: path, u64 declared size, u32 mode
    // Out: u32 session
    fn begin_write_file(&mut self, input: &mut PayloadReader, out: &mut PayloadWriter) -> Result<(), FsError> {
        let (drive, relative) = input.path()?;
        let declared = input.u64()?;
        let mode = WriteMode::try_from(input.u32()?)?;
        let id = self
            .transfers
            .begin_write(self.drives, drive, &relative, declared, mode)?;
        out.u32(id);
        Ok(())
    }

    // In: u32 session, bytes
    // Out: u64 bytes remaining
    fn write_file_chunk(&mut self, input: &mut PayloadReader, out: &mut PayloadWriter) -> Result<(), FsError> {
        let id = input.u32()?;
        let remaining = self.transfers.write_chunk(id, input.rest())?;
        out.u64(remaining);
        Ok(())
    }

    fn end_write_file(&mut self, input: &mut PayloadReader) -> Result<(), FsError> {
        let id = input.u32()?;
        self.transfers.end_write(id)
    }

    fn cancel_transfer(&mut self, input: &mut PayloadReader) -> Result<(), FsError> {
        let id = input.u32()?;
        self.transfers.cancel(id)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    fn create_file(&self, input: &mut PayloadReader) -> Result<(), FsError> {
        let (drive, relative) = input.path()?;
        self.drives.create_file(drive, &relative)
    }

    fn create_directory(&self, input: &mut PayloadReader) -> Result<(), FsError> {
        let (drive, relative) = input.path()?;
        self.drives.create_directory(drive, &relative)
    }

    fn delete_path(&self, input: &mut PayloadReader) -> Result<(), FsError> {
        let (drive, relative) = input.path()?;
        self.drives.delete(drive, &relative)
    }

    // In: path (from), path (to)
    fn rename_path(&self, input: &mut PayloadReader) -> Result<(), FsError> {
        let (from_drive, from) = input.path()?;
        let (to_drive, to) = input.path()?;
        self.drives.rename(from_drive, &from, to_drive, &to)
    }

    // -----------------------------------------------------------------------
    // Shortcuts
    // -----------------------------------------------------------------------

    fn get_special_path_count(&self, out: &mut PayloadWriter) -> Result<(), FsError> {
        out.u32(self.drives.special_paths().len() as u32);
        Ok(())
    }

    // In: u32 index
    // Out: string name, path
    fn get_special_path(&self, input: &mut PayloadReader, out: &mut PayloadWriter) -> Result<(), FsError> {
        let index = input.u32()?;
        let special = self
            .drives
            .special_paths()
            .get(index as usize)
            .ok_or(NotFound::InvalidIndex(index))?;
        out.string(&special.name).path(special.drive, &special.relative);
        Ok(())
    }

    // Out: path
    fn select_file(&self, out: &mut PayloadWriter) -> Result<(), FsError> {
        let (drive, relative) = self.drives.selected_file().ok_or(NotFound::NoSelection)?;
        out.path(drive, &relative);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ProtocolError;
    use crate::protocol::{PathType, ResultCode};
    use std::fs;

    fn path_payload(drive: u32, relative: &str) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        w.path(drive, relative);
        w.finish()
    }

    #[test]
    fn stat_path_encodes_type_and_size() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello, world!").unwrap();
        let drives =
            DriveTable::new(&Config::new(vec![dir.path().to_path_buf()]).without_special_paths())
                .unwrap();
        let mut dispatcher = Dispatcher::new(&drives);

        let out = dispatcher
            .handle(CommandId::StatPath, &path_payload(0, "notes.txt"))
            .unwrap();
        let mut r = PayloadReader::new(&out);
        assert_eq!(r.u32().unwrap(), PathType::File as u32);
        assert_eq!(r.u64().unwrap(), 13);
    }

    #[test]
    fn short_payload_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let drives =
            DriveTable::new(&Config::new(vec![dir.path().to_path_buf()]).without_special_paths())
                .unwrap();
        let mut dispatcher = Dispatcher::new(&drives);

        let err = dispatcher.handle(CommandId::GetDriveInfo, &[1, 0]).unwrap_err();
        assert!(matches!(err, FsError::Protocol(ProtocolError::Malformed(_))));
        assert_eq!(err.result_code(), ResultCode::MalformedPayload);
    }

    #[test]
    fn indexed_listing_checks_bounds() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        let drives =
            DriveTable::new(&Config::new(vec![dir.path().to_path_buf()]).without_special_paths())
                .unwrap();
        let mut dispatcher = Dispatcher::new(&drives);

        let mut payload = path_payload(0, "");
        payload.extend_from_slice(&0u32.to_le_bytes());
        let out = dispatcher.handle(CommandId::GetDirectory, &payload).unwrap();
        assert_eq!(PayloadReader::new(&out).string().unwrap(), "a");

        let err = dispatcher.handle(CommandId::GetFile, &payload).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::InvalidIndex);
    }

    #[test]
    fn select_file_without_selection_is_canceled() {
        let dir = tempfile::tempdir().unwrap();
        let drives =
            DriveTable::new(&Config::new(vec![dir.path().to_path_buf()]).without_special_paths())
                .unwrap();
        let mut dispatcher = Dispatcher::new(&drives);
        let err = dispatcher.handle(CommandId::SelectFile, &[]).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::SelectionCanceled);
    }

    #[test]
    fn unknown_write_mode_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let drives =
            DriveTable::new(&Config::new(vec![dir.path().to_path_buf()]).without_special_paths())
                .unwrap();
        let mut dispatcher = Dispatcher::new(&drives);

        let mut w = PayloadWriter::new();
        w.path(0, "x.bin").u64(1).u32(9);
        let err = dispatcher.handle(CommandId::BeginWriteFile, &w.finish()).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::InvalidFileMode);
        assert!(!dir.path().join("x.bin").exists());
    }
}
