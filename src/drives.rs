//! Virtual drives: the host directories the client is allowed to see.
//!
//! Client paths arrive as `(drive index, relative path)`. Every path goes
//! through [`normalize`] (pure, no filesystem access) and then a containment
//! check against the canonical drive root after symlink resolution. Nothing
//! is cached between commands; mutating operations resolve again right
//! before they act.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::config::Config;
use crate::error::{ConfigError, FsError, InvalidState, IoResultExt, NotFound, Security};
use crate::protocol::{DriveKind, PathType};

/// Folders under the user's home offered as shortcuts.
const SPECIAL_DIRS: [&str; 2] = ["Desktop", "Documents"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drive {
    pub index: u32,
    pub label: String,
    /// Canonical host path (a directory, or the file of a single-file drive).
    pub root: PathBuf,
    pub kind: DriveKind,
}

impl Drive {
    /// Prefix shown by the client in front of paths on this drive.
    pub fn prefix(&self) -> String {
        format!("{}:/", self.label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub kind: PathType,
    pub size: u64,
    /// Seconds since the Unix epoch, 0 if the platform does not report it.
    pub modified: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub stat: Stat,
}

/// A well-known host folder expressed as a location inside some drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialPath {
    pub name: String,
    pub drive: u32,
    pub relative: String,
}

/// Lexically normalize a client-relative path.
///
/// Accepts `/` and `\` separators, ignores empty and `.` components and
/// applies `..`. Fails with `PathEscape` if `..` climbs above the root or a
/// component carries a NUL byte. On Windows a `:` is refused as well, since
/// there it introduces a drive letter or a stream name.
pub fn normalize(relative: &str) -> Result<PathBuf, FsError> {
    let mut parts: Vec<&str> = Vec::new();
    for part in relative.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(Security::PathEscape.into());
                }
            }
            p if p.contains('\0') || (cfg!(windows) && p.contains(':')) => {
                return Err(Security::PathEscape.into());
            }
            p => parts.push(p),
        }
    }
    Ok(parts.iter().collect())
}

/// Check that `path` (already lexically under `root`) still lands under
/// `root` once symlinks are followed. Non-existent tails are checked through
/// their deepest existing ancestor.
fn confine(root: &Path, path: &Path) -> Result<(), FsError> {
    let mut probe = path.to_path_buf();
    loop {
        match fs::canonicalize(&probe) {
            Ok(real) if real.starts_with(root) => return Ok(()),
            Ok(real) => {
                log::warn!("{} resolves to {} outside {}", path.display(), real.display(), root.display());
                return Err(Security::PathEscape.into());
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // A dangling link cannot be checked, so it is refused.
                if fs::symlink_metadata(&probe).is_ok() {
                    return Err(Security::PathEscape.into());
                }
                if !probe.pop() || !probe.starts_with(root) {
                    return Err(Security::PathEscape.into());
                }
            }
            Err(err) => return Err(FsError::Io(err)),
        }
    }
}

fn label_for(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn modified_secs(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs())
}

fn stat_of(meta: &fs::Metadata) -> Stat {
    if meta.is_dir() {
        Stat {
            kind: PathType::Directory,
            size: 0,
            modified: modified_secs(meta),
        }
    } else {
        Stat {
            kind: PathType::File,
            size: meta.len(),
            modified: modified_secs(meta),
        }
    }
}

/// `/`-separated form of a host-relative path, as the client expects it.
fn to_wire(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// The immutable set of drives for one session.
#[derive(Debug, Clone)]
pub struct DriveTable {
    drives: Vec<Drive>,
    selected: Option<u32>,
    special: Vec<SpecialPath>,
}

impl DriveTable {
    /// Validate the configuration and assign drive indices in order.
    ///
    /// A regular file given as a drive path exposes its parent directory.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let mut drives = Vec::with_capacity(config.drives.len() + 1);

        for path in &config.drives {
            let drive_err = |source| ConfigError::DrivePath {
                path: path.clone(),
                source,
            };
            let canonical = fs::canonicalize(path).map_err(drive_err)?;
            let root = if canonical.is_file() {
                canonical
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or(canonical)
            } else {
                canonical
            };
            if !root.is_dir() {
                return Err(ConfigError::DriveNotADirectory { path: path.clone() });
            }
            fs::read_dir(&root).map_err(drive_err)?;

            let index = drives.len() as u32;
            log::info!("drive {}: {}", index, root.display());
            drives.push(Drive {
                index,
                label: label_for(&root),
                root,
                kind: DriveKind::Directory,
            });
        }

        let mut selected = None;
        if let Some(path) = &config.selected_file {
            let file_err = |source| ConfigError::SelectedFile {
                path: path.clone(),
                source,
            };
            let canonical = fs::canonicalize(path).map_err(file_err)?;
            if !canonical.is_file() {
                return Err(ConfigError::SelectedNotAFile { path: path.clone() });
            }
            fs::File::open(&canonical).map_err(file_err)?;

            let index = drives.len() as u32;
            log::info!("drive {} (selected file): {}", index, canonical.display());
            drives.push(Drive {
                index,
                label: label_for(&canonical),
                root: canonical,
                kind: DriveKind::SingleFile,
            });
            selected = Some(index);
        }

        let mut table = DriveTable {
            drives,
            selected,
            special: Vec::new(),
        };
        if config.special_paths {
            table.special = table.find_special_paths();
        }
        Ok(table)
    }

    fn find_special_paths(&self) -> Vec<SpecialPath> {
        match std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
            Some(home) => self.special_paths_under(Path::new(&home)),
            None => Vec::new(),
        }
    }

    /// Well-known folders of `home` that exist and lie inside some drive.
    fn special_paths_under(&self, home: &Path) -> Vec<SpecialPath> {
        SPECIAL_DIRS
            .iter()
            .filter_map(|name| {
                let dir = fs::canonicalize(home.join(name)).ok()?;
                if !dir.is_dir() {
                    return None;
                }
                let (drive, relative) = self.locate(&dir)?;
                log::debug!("special path {} -> drive {} {:?}", name, drive, relative);
                Some(SpecialPath {
                    name: (*name).to_owned(),
                    drive,
                    relative,
                })
            })
            .collect()
    }

    pub fn drives(&self) -> &[Drive] {
        &self.drives
    }

    pub fn drive(&self, index: u32) -> Result<&Drive, FsError> {
        self.drives
            .get(index as usize)
            .ok_or_else(|| NotFound::InvalidDrive(index).into())
    }

    pub fn special_paths(&self) -> &[SpecialPath] {
        &self.special
    }

    /// `(drive, relative)` of the selected file, if one was configured.
    pub fn selected_file(&self) -> Option<(u32, String)> {
        let index = self.selected?;
        let drive = self.drives.get(index as usize)?;
        Some((index, drive.label.clone()))
    }

    /// Express a canonical host path as a location inside a directory drive.
    pub fn locate(&self, host: &Path) -> Option<(u32, String)> {
        self.drives
            .iter()
            .filter(|d| d.kind == DriveKind::Directory)
            .find_map(|d| {
                let relative = host.strip_prefix(&d.root).ok()?;
                Some((d.index, to_wire(relative)))
            })
    }

    /// Map a client path to a host path inside its drive.
    ///
    /// A single-file drive behaves as a directory holding only its file, so
    /// the only path that resolves on it is the file's name.
    pub fn resolve(&self, index: u32, relative: &str) -> Result<PathBuf, FsError> {
        let drive = self.drive(index)?;
        let normalized = normalize(relative)?;

        match drive.kind {
            DriveKind::SingleFile => {
                if normalized.as_path() == Path::new(&drive.label) {
                    Ok(drive.root.clone())
                } else {
                    Err(NotFound::NoSuchPath(relative.to_owned()).into())
                }
            }
            DriveKind::Directory => {
                let joined = drive.root.join(&normalized);
                confine(&drive.root, &joined)?;
                Ok(joined)
            }
        }
    }

    /// Resolve a path that is about to be created, removed or moved.
    pub(crate) fn resolve_for_update(&self, index: u32, relative: &str) -> Result<PathBuf, FsError> {
        let drive = self.drive(index)?;
        if drive.kind == DriveKind::SingleFile {
            return Err(Security::ReadOnlyDrive.into());
        }
        if normalize(relative)?.as_os_str().is_empty() {
            return Err(Security::ReadOnlyDrive.into());
        }
        self.resolve(index, relative)
    }

    fn is_virtual_root(&self, drive: &Drive, relative: &str) -> Result<bool, FsError> {
        Ok(drive.kind == DriveKind::SingleFile && normalize(relative)?.as_os_str().is_empty())
    }

    pub fn stat(&self, index: u32, relative: &str) -> Result<Stat, FsError> {
        let drive = self.drive(index)?;
        if self.is_virtual_root(drive, relative)? {
            let meta = fs::metadata(&drive.root).at(relative)?;
            return Ok(Stat {
                kind: PathType::Directory,
                size: 0,
                modified: modified_secs(&meta),
            });
        }

        let path = self.resolve(index, relative)?;
        let meta = fs::metadata(&path).at(relative)?;
        Ok(stat_of(&meta))
    }

    /// Entries of a directory in the order the host filesystem yields them.
    ///
    /// Links that point outside the drive and entries whose metadata cannot
    /// be read are left out.
    pub fn list_entries(&self, index: u32, relative: &str) -> Result<Vec<Entry>, FsError> {
        let drive = self.drive(index)?;
        if self.is_virtual_root(drive, relative)? {
            let meta = fs::metadata(&drive.root).at(relative)?;
            return Ok(vec![Entry {
                name: drive.label.clone(),
                stat: stat_of(&meta),
            }]);
        }

        let dir = self.resolve(index, relative)?;
        let meta = fs::metadata(&dir).at(relative)?;
        if !meta.is_dir() {
            return Err(InvalidState::NotADirectory.into());
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir).at(relative)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_symlink() && confine(&drive.root, &path).is_err() {
                log::debug!("skipping {} (link leaves drive {})", path.display(), index);
                continue;
            }
            // The client could not address a lossily converted name.
            let Ok(name) = entry.file_name().into_string() else {
                log::debug!("skipping {} (name is not UTF-8)", path.display());
                continue;
            };
            match fs::metadata(&path) {
                Ok(meta) => entries.push(Entry {
                    name,
                    stat: stat_of(&meta),
                }),
                Err(err) => log::debug!("skipping {}: {}", path.display(), err),
            }
        }
        Ok(entries)
    }

    /// Names of the regular files in a directory.
    pub fn files(&self, index: u32, relative: &str) -> Result<Vec<String>, FsError> {
        self.names_of_kind(index, relative, PathType::File)
    }

    /// Names of the subdirectories of a directory.
    pub fn directories(&self, index: u32, relative: &str) -> Result<Vec<String>, FsError> {
        self.names_of_kind(index, relative, PathType::Directory)
    }

    fn names_of_kind(&self, index: u32, relative: &str, kind: PathType) -> Result<Vec<String>, FsError> {
        Ok(self
            .list_entries(index, relative)?
            .into_iter()
            .filter(|e| e.stat.kind == kind)
            .map(|e| e.name)
            .collect())
    }

    /// Create an empty file, leaving an existing one untouched.
    pub fn create_file(&self, index: u32, relative: &str) -> Result<(), FsError> {
        let path = self.resolve_for_update(index, relative)?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .at(relative)?;
        log::info!("CREATE file {}", path.display());
        Ok(())
    }

    pub fn create_directory(&self, index: u32, relative: &str) -> Result<(), FsError> {
        let path = self.resolve_for_update(index, relative)?;
        fs::create_dir(&path).at(relative)?;
        log::info!("MKDIR {}", path.display());
        Ok(())
    }

    /// Remove a file, a link, or a directory tree.
    pub fn delete(&self, index: u32, relative: &str) -> Result<(), FsError> {
        let path = self.resolve_for_update(index, relative)?;
        let meta = fs::symlink_metadata(&path).at(relative)?;
        if meta.is_dir() {
            fs::remove_dir_all(&path).at(relative)?;
        } else {
            fs::remove_file(&path).at(relative)?;
        }
        log::info!("DELETE {}", path.display());
        Ok(())
    }

    /// Move an entry; the destination must not exist yet.
    pub fn rename(
        &self,
        from_index: u32,
        from: &str,
        to_index: u32,
        to: &str,
    ) -> Result<(), FsError> {
        let source = self.resolve_for_update(from_index, from)?;
        let target = self.resolve_for_update(to_index, to)?;

        fs::symlink_metadata(&source).at(from)?;
        if fs::symlink_metadata(&target).is_ok() {
            return Err(InvalidState::AlreadyExists.into());
        }
        fs::rename(&source, &target).at(to)?;
        log::info!("RENAME {} -> {}", source.display(), target.display());
        Ok(())
    }
}
