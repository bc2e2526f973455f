/*!
Atomic replacement of the primary flow document.

A new version is streamed into a sibling temporary file, synced, and only then
moved over the primary path. Readers see either the old document or the new
one. The temporary file is removed on every exit path by a `Drop` guard.
*/

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use flowstore_retry::{classify, local_storage_backoff_with, retry_blocking, RetryError};

use crate::compression::CompressionAdapter;
use crate::config::RenamePolicy;
use crate::location::StorageLocation;
use crate::observability;
use crate::{FlowStoreError, Result};

/// Writer adapter that counts the bytes passing through it
pub struct CountingWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> (W, u64) {
        (self.inner, self.count)
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.count += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// In-flight atomic write of the primary document
///
/// ```text
/// Idle -> WritingTemp -> Committing -> Idle
///              |             |
///              v             v
///            Failed <- RetryingRename
/// ```
pub struct AtomicWriter<'a> {
    location: &'a StorageLocation,
    temp_path: PathBuf,
    file: Option<File>,
    /// Whether the temporary file still belongs to us and must be removed
    armed: bool,
}

impl<'a> AtomicWriter<'a> {
    /// Create (or truncate a stale) temporary file beside the primary
    pub fn create(location: &'a StorageLocation) -> Result<Self> {
        let temp_path = location.temp_path();
        let file =
            File::create(&temp_path).map_err(|e| FlowStoreError::write(&temp_path, e))?;
        debug!("Opened temporary flow file {}", temp_path.display());

        Ok(Self {
            location,
            temp_path,
            file: Some(file),
            armed: true,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Stream the document through `codec` into the temporary file
    ///
    /// `produce` receives the uncompressed sink. Returns the number of
    /// uncompressed bytes produced.
    pub fn write_with<F>(&mut self, codec: &dyn CompressionAdapter, produce: F) -> Result<u64>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let temp_path = self.temp_path.clone();
        let file = self.file.as_mut().ok_or_else(|| {
            FlowStoreError::write(
                &temp_path,
                io::Error::new(io::ErrorKind::Other, "temporary file already closed"),
            )
        })?;

        let mut sink = CountingWriter::new(codec.wrap_for_write(Box::new(BufWriter::new(file))));
        produce(&mut sink).map_err(|e| match e {
            FlowStoreError::Io(io_err) => FlowStoreError::write(&temp_path, io_err),
            other => other,
        })?;
        let (framed, count) = sink.into_inner();
        framed
            .finish()
            .map_err(|e| FlowStoreError::write(&temp_path, e))?;

        Ok(count)
    }

    /// Sync the temporary file and move it over the primary
    pub fn commit(mut self, policy: &RenamePolicy) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()
                .map_err(|e| FlowStoreError::write(&self.temp_path, e))?;
        }

        let location = self.location;
        let primary = location.path();
        let temp_path = self.temp_path.clone();
        let result = retry_blocking(
            "rename flow configuration",
            policy.max_attempts,
            local_storage_backoff_with(policy.initial_backoff()),
            |attempt| {
                if attempt > 1 {
                    observability::record_rename_retry();
                }
                replace_file(&temp_path, primary, attempt > 1)
                    .map_err(|e| classify("rename flow configuration", e))
            },
        );

        match result {
            Ok(()) => {
                self.armed = false;
                sync_dir(location.parent());
                info!("Committed flow configuration to {}", primary.display());
                Ok(())
            }
            Err(err) => {
                let attempts = err.attempts().unwrap_or(1);
                Err(FlowStoreError::Commit {
                    path: primary.to_path_buf(),
                    attempts,
                    source: into_io_error(err),
                })
            }
        }
    }
}

impl Drop for AtomicWriter<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Close before unlinking so the removal also works on Windows
        drop(self.file.take());
        match fs::remove_file(&self.temp_path) {
            Ok(()) => debug!("Removed temporary flow file {}", self.temp_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove temporary flow file {}: {}",
                self.temp_path.display(),
                e
            ),
        }
    }
}

/// Move `temp` over `primary`
///
/// The rename replaces an existing primary in one step where the platform
/// allows it. If the platform refuses to overwrite, the primary is deleted
/// first and the rename repeated.
fn replace_file(temp: &Path, primary: &Path, retrying: bool) -> io::Result<()> {
    match fs::rename(temp, primary) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists || (retrying && primary.is_file()) => {
            debug!(
                "Rename over {} refused ({}); deleting it first",
                primary.display(),
                e
            );
            match fs::remove_file(primary) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            fs::rename(temp, primary)
        }
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!("Could not sync directory {}: {}", dir.display(), e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn into_io_error(err: RetryError) -> io::Error {
    match err.into_source().downcast::<io::Error>() {
        Ok(io_err) => *io_err,
        Err(other) => io::Error::new(io::ErrorKind::Other, other),
    }
}

/// Atomically replace the primary document with the bytes `produce` writes
///
/// Returns the number of uncompressed bytes written.
pub fn write_atomic<F>(
    location: &StorageLocation,
    codec: &dyn CompressionAdapter,
    policy: &RenamePolicy,
    produce: F,
) -> Result<u64>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let mut writer = AtomicWriter::create(location)?;
    let written = writer.write_with(codec, produce)?;
    writer.commit(policy)?;
    Ok(written)
}
