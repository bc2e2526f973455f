/*!
Location of the primary flow document on the local filesystem.
*/

use std::ffi::{OsStr, OsString};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::compression::{CompressionAdapter, GzipCompressor};
use crate::{FlowStoreError, Result};

/// Suffix appended to the primary file name for the in-flight temporary file
pub const TEMP_FILE_SUFFIX: &str = ".new.xml.gz";

/// Verified location of the primary flow document
///
/// Construction makes sure the document exists (creating an empty one and any
/// missing parent directories) and that it can be read and written. Nothing
/// else in the crate touches the primary path without going through a
/// `StorageLocation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    path: PathBuf,
    parent: PathBuf,
    file_name: OsString,
}

impl StorageLocation {
    /// Prepare the storage location at `path` for a gzip framed document
    ///
    /// # Errors
    /// `FlowStoreError::Setup` if the parent cannot be created, is not a
    /// writable directory, or the document exists without read/write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, &GzipCompressor::new())
    }

    /// Prepare the storage location, checking leftovers against `codec`
    ///
    /// A temporary file from an interrupted save is only promoted when it
    /// decodes as a complete stream through `codec`.
    pub fn open_with(path: impl AsRef<Path>, codec: &dyn CompressionAdapter) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file_name = path
            .file_name()
            .ok_or_else(|| {
                FlowStoreError::setup(
                    &path,
                    io::Error::new(io::ErrorKind::InvalidInput, "path does not name a file"),
                )
            })?
            .to_os_string();
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Self::recover_interrupted_save(&path, &parent, codec)?;

        if path.exists() {
            Self::verify_access(&path)?;
        } else {
            Self::ensure_parent_dir(&parent)?;
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => info!("Created empty flow configuration at {}", path.display()),
                // Lost a race with another creator; the file is there now.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    Self::verify_access(&path)?
                }
                Err(e) => return Err(FlowStoreError::setup(&path, e)),
            }
        }

        Self::verify_parent_writable(&parent)?;

        Ok(Self {
            path,
            parent,
            file_name,
        })
    }

    /// Clean up after a save that was interrupted by a crash
    ///
    /// A temporary file beside a missing primary is promoted only if it holds
    /// a complete stream; a partial one is discarded so the store reopens
    /// empty. A temporary file beside an existing primary is always discarded.
    fn recover_interrupted_save(
        path: &Path,
        parent: &Path,
        codec: &dyn CompressionAdapter,
    ) -> Result<()> {
        let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(TEMP_FILE_SUFFIX);
        let temp_path = parent.join(temp_name);

        let temp_len = match fs::metadata(&temp_path) {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Ok(()),
        };

        if !path.exists() && temp_len > 0 && Self::is_complete_stream(&temp_path, codec) {
            warn!(
                "Recovering flow configuration from interrupted save {}",
                temp_path.display()
            );
            fs::rename(&temp_path, path).map_err(|e| FlowStoreError::setup(&temp_path, e))?;
        } else {
            warn!(
                "Discarding leftover temporary flow file {}",
                temp_path.display()
            );
            fs::remove_file(&temp_path).map_err(|e| FlowStoreError::setup(&temp_path, e))?;
        }
        Ok(())
    }

    /// True when `path` decodes through `codec` to end of stream without error
    fn is_complete_stream(path: &Path, codec: &dyn CompressionAdapter) -> bool {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(_) => return false,
        };
        let mut reader = codec.wrap_for_read(Box::new(BufReader::new(file)));
        match io::copy(&mut reader, &mut io::sink()) {
            Ok(_) => true,
            Err(e) => {
                debug!("Temporary flow file {} is incomplete: {}", path.display(), e);
                false
            }
        }
    }

    /// Create the parent directory chain if it is missing
    fn ensure_parent_dir(parent: &Path) -> Result<()> {
        match fs::metadata(parent) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(FlowStoreError::setup(
                parent,
                io::Error::new(io::ErrorKind::Other, "parent exists but is not a directory"),
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // metadata() follows links, so a dangling symlink lands here too
                if fs::symlink_metadata(parent).is_ok() {
                    return Err(FlowStoreError::setup(
                        parent,
                        io::Error::new(
                            io::ErrorKind::Other,
                            "parent is a symbolic link that does not resolve to a directory",
                        ),
                    ));
                }
                debug!("Creating directory {}", parent.display());
                fs::create_dir_all(parent).map_err(|e| FlowStoreError::setup(parent, e))
            }
            Err(e) => Err(FlowStoreError::setup(parent, e)),
        }
    }

    fn verify_access(path: &Path) -> Result<()> {
        let meta = fs::metadata(path).map_err(|e| FlowStoreError::setup(path, e))?;
        if !meta.is_file() {
            return Err(FlowStoreError::setup(
                path,
                io::Error::new(io::ErrorKind::Other, "exists but is not a regular file"),
            ));
        }

        let insufficient = |e: io::Error| {
            FlowStoreError::setup(
                path,
                io::Error::new(
                    e.kind(),
                    format!("exists but you have insufficient read/write privileges: {e}"),
                ),
            )
        };
        File::open(path).map_err(insufficient)?;
        OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(insufficient)?;
        Ok(())
    }

    /// Create and drop a scratch file, so ownership and ACLs are honored
    fn verify_parent_writable(parent: &Path) -> Result<()> {
        tempfile::NamedTempFile::new_in(parent)
            .map(drop)
            .map_err(|e| {
                FlowStoreError::setup(
                    parent,
                    io::Error::new(e.kind(), format!("directory is not writable: {e}")),
                )
            })
    }

    /// Path of the primary document
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the primary document
    pub fn parent(&self) -> &Path {
        &self.parent
    }

    /// Base file name of the primary document
    pub fn file_name(&self) -> &OsStr {
        &self.file_name
    }

    /// Sibling path used for the in-flight temporary file
    pub fn temp_path(&self) -> PathBuf {
        let mut name = self.file_name.clone();
        name.push(TEMP_FILE_SUFFIX);
        self.parent.join(name)
    }

    /// Current length of the primary document; zero when it is missing
    pub fn len(&self) -> Result<u64> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// True when the primary document is missing or zero-length
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
