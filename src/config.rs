use std::path::PathBuf;

/// Startup configuration. Built once by the caller, validated by
/// `DriveTable::new`, and never touched again while the session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Host directories exposed as drives 0..N-1, in this order.
    pub drives: Vec<PathBuf>,
    /// File offered through `SelectFile`; also exposed as a read-only drive.
    pub selected_file: Option<PathBuf>,
    /// Offer the user's Desktop and Documents folders when a drive contains them.
    pub special_paths: bool,
}

impl Config {
    pub fn new(drives: Vec<PathBuf>) -> Self {
        Config {
            drives,
            selected_file: None,
            special_paths: true,
        }
    }

    pub fn with_selected_file(mut self, path: PathBuf) -> Self {
        self.selected_file = Some(path);
        self
    }

    pub fn without_special_paths(mut self) -> Self {
        self.special_paths = false;
        self
    }

    /// Build from command-line style arguments.
    ///
    /// Without an explicit selected file, a first positional argument that
    /// names a regular file is taken as the selected file instead of a drive.
    pub fn from_args(selected_file: Option<PathBuf>, mut paths: Vec<PathBuf>) -> Self {
        let selected_file = match selected_file {
            Some(path) => Some(path),
            None if paths.first().is_some_and(|p| p.is_file()) => Some(paths.remove(0)),
            None => None,
        };
        Config {
            drives: paths,
            selected_file,
            special_paths: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn first_file_argument_becomes_selected_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("game.nsp");
        fs::write(&file, b"x").unwrap();

        let config = Config::from_args(None, vec![file.clone(), dir.path().to_path_buf()]);
        assert_eq!(config.selected_file, Some(file));
        assert_eq!(config.drives, vec![dir.path().to_path_buf()]);
    }

    #[test]
    fn explicit_selected_file_keeps_all_drives() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("game.nsp");
        fs::write(&file, b"x").unwrap();

        let config = Config::from_args(Some(file.clone()), vec![file.clone()]);
        assert_eq!(config.selected_file, Some(file.clone()));
        assert_eq!(config.drives, vec![file]);
    }
}
