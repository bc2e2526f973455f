/*!
The flow configuration store.

[`FlowConfigurationStore`] ties together the storage location, compression
framing, atomic writer and archive manager. Every operation that touches the
primary document runs under one exclusive lock owned by the store, so loads
never observe a save in progress and concurrent saves are applied one after
the other (last writer wins). Archiving after a save happens once the lock is
released and never fails the save.
*/

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::archive::{ArchiveEntry, ArchiveManager};
use crate::compression::{CompressionAdapter, GzipCompressor, NoCompression};
use crate::config::{RenamePolicy, StorageConfig};
use crate::error::BoxError;
use crate::location::StorageLocation;
use crate::observability;
use crate::writer::{write_atomic, CountingWriter};
use crate::{FlowStoreError, Result};

/// Produces the document bytes for a save
///
/// The flow model and its encoding live outside this crate; the store only
/// hands the serializer an uncompressed sink.
pub trait FlowSerializer {
    fn serialize(&self, out: &mut dyn Write) -> std::result::Result<(), BoxError>;
}

/// Applies a proposed document to the running flow
pub trait FlowSynchronizer {
    fn synchronize(&self, proposed: &[u8]) -> std::result::Result<(), BoxError>;
}

/// Serializer backed by a closure, see [`serializer_fn`]
pub struct FnSerializer<F>(F);

impl<F> FlowSerializer for FnSerializer<F>
where
    F: Fn(&mut dyn Write) -> std::result::Result<(), BoxError>,
{
    fn serialize(&self, out: &mut dyn Write) -> std::result::Result<(), BoxError> {
        (self.0)(out)
    }
}

/// Wrap a closure as a [`FlowSerializer`]
pub fn serializer_fn<F>(f: F) -> FnSerializer<F>
where
    F: Fn(&mut dyn Write) -> std::result::Result<(), BoxError>,
{
    FnSerializer(f)
}

/// Serializer that writes a fixed byte payload
pub struct BytesSerializer<'a>(pub &'a [u8]);

impl FlowSerializer for BytesSerializer<'_> {
    fn serialize(&self, out: &mut dyn Write) -> std::result::Result<(), BoxError> {
        out.write_all(self.0)?;
        Ok(())
    }
}

/// Synchronizer backed by a closure, see [`synchronizer_fn`]
pub struct FnSynchronizer<F>(F);

impl<F> FlowSynchronizer for FnSynchronizer<F>
where
    F: Fn(&[u8]) -> std::result::Result<(), BoxError>,
{
    fn synchronize(&self, proposed: &[u8]) -> std::result::Result<(), BoxError> {
        (self.0)(proposed)
    }
}

/// Wrap a closure as a [`FlowSynchronizer`]
pub fn synchronizer_fn<F>(f: F) -> FnSynchronizer<F>
where
    F: Fn(&[u8]) -> std::result::Result<(), BoxError>,
{
    FnSynchronizer(f)
}

/// Durable, crash-safe store for a single flow configuration document
///
/// # Example
/// ```rust,no_run
/// use flowstore_core::{BytesSerializer, FlowConfigurationStore};
///
/// let store = FlowConfigurationStore::open("/var/lib/flow/flow.xml.gz")?;
/// store.save_document(&BytesSerializer(b"<flow/>"), true)?;
///
/// let mut restored = Vec::new();
/// store.load(&mut restored)?;
/// assert_eq!(restored, b"<flow/>");
/// # Ok::<(), flowstore_core::FlowStoreError>(())
/// ```
pub struct FlowConfigurationStore<C: CompressionAdapter = GzipCompressor> {
    guard: Mutex<StorageLocation>,
    path: PathBuf,
    compressor: C,
    archiver: ArchiveManager,
    rename_policy: RenamePolicy,
    archive_max_count: Option<usize>,
}

impl FlowConfigurationStore<GzipCompressor> {
    /// Open the store at `path` with default settings
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_config(&StorageConfig::new(path.as_ref()))
    }

    /// Open the store described by `config`
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let compressor = match config.compression_level {
            Some(level) => GzipCompressor::with_level(level),
            None => GzipCompressor::new(),
        };
        Self::with_compressor(config, compressor)
    }
}

impl<C: CompressionAdapter> FlowConfigurationStore<C> {
    /// Open the store described by `config` with a custom compression adapter
    pub fn with_compressor(config: &StorageConfig, compressor: C) -> Result<Self> {
        config.validate()?;
        let location = StorageLocation::open_with(&config.flow_path, &compressor)?;
        debug!(
            "Opened flow configuration store at {} ({})",
            location.path().display(),
            compressor.algorithm_name()
        );

        Ok(Self {
            path: location.path().to_path_buf(),
            guard: Mutex::new(location),
            compressor,
            archiver: ArchiveManager::from_config(config),
            rename_policy: config.rename.clone(),
            archive_max_count: config.archive_max_count,
        })
    }

    /// Path of the primary document
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn archive_manager(&self) -> &ArchiveManager {
        &self.archiver
    }

    /// Directory archive entries are written to
    pub fn archive_dir(&self) -> PathBuf {
        self.archiver.resolve_dir(&self.path)
    }

    fn lock(&self) -> MutexGuard<'_, StorageLocation> {
        // The guarded value is immutable, so a panic while holding the lock
        // cannot have left it inconsistent.
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy the decompressed document into `out`
    ///
    /// Writes nothing and returns 0 when the primary is missing or empty.
    pub fn load(&self, out: &mut dyn Write) -> Result<u64> {
        self.load_with_mode(out, false)
    }

    /// Copy the document into `out`, verbatim when `raw` is set
    pub fn load_with_mode(&self, out: &mut dyn Write, raw: bool) -> Result<u64> {
        let location = self.lock();
        if location.is_empty()? {
            debug!("Flow configuration {} is empty", location.path().display());
            return Ok(0);
        }

        let file = match File::open(location.path()) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let source: Box<dyn Read + '_> = Box::new(BufReader::new(file));
        let mut reader = if raw {
            NoCompression.wrap_for_read(source)
        } else {
            self.compressor.wrap_for_read(source)
        };

        let copied = io::copy(&mut reader, out).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
                FlowStoreError::compression(format!(
                    "Failed to decompress {}: {e}",
                    location.path().display()
                ))
            }
            _ => FlowStoreError::Io(e),
        })?;
        debug!("Loaded {} bytes from {}", copied, location.path().display());
        Ok(copied)
    }

    /// Load the decompressed document into memory
    pub fn load_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.load(&mut buffer)?;
        Ok(buffer)
    }

    /// Compress `source` straight into the primary document
    ///
    /// This overwrites the primary in place and is not crash-safe; use
    /// [`save_document`](Self::save_document) for atomic replacement.
    pub fn save(&self, source: &mut dyn Read) -> Result<u64> {
        self.save_with_mode(source, false)
    }

    /// In-place save, copying `source` verbatim when `raw` is set
    pub fn save_with_mode(&self, source: &mut dyn Read, raw: bool) -> Result<u64> {
        let location = self.lock();
        let path = location.path();
        let codec: &dyn CompressionAdapter = if raw { &NoCompression } else { &self.compressor };

        let result = (|| -> Result<u64> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|e| FlowStoreError::write(path, e))?;

            let mut sink = CountingWriter::new(codec.wrap_for_write(Box::new(BufWriter::new(&mut file))));
            io::copy(source, &mut sink).map_err(|e| FlowStoreError::write(path, e))?;
            let (framed, written) = sink.into_inner();
            framed.finish().map_err(|e| FlowStoreError::write(path, e))?;
            file.sync_all().map_err(|e| FlowStoreError::write(path, e))?;
            Ok(written)
        })();

        match &result {
            Ok(written) => {
                observability::record_save(*written);
                debug!("Wrote {} bytes in place to {}", written, path.display());
            }
            Err(_) => observability::record_save_failure(),
        }
        result
    }

    /// Atomically replace the document with the serializer's output
    ///
    /// With `archive` set, the committed document is then copied into the
    /// archive directory. Archive failures are logged and do not fail the
    /// save; the returned path is `None` in that case.
    pub fn save_document<S>(&self, serializer: &S, archive: bool) -> Result<Option<PathBuf>>
    where
        S: FlowSerializer + ?Sized,
    {
        {
            let location = self.lock();
            let result = write_atomic(&location, &self.compressor, &self.rename_policy, |out| {
                serializer.serialize(out).map_err(serialization_error)
            });

            match result {
                Ok(written) => observability::record_save(written),
                Err(e) => {
                    observability::record_save_failure();
                    return Err(e);
                }
            }
        }

        if !archive {
            return Ok(None);
        }
        Ok(self.archive_best_effort())
    }

    fn archive_best_effort(&self) -> Option<PathBuf> {
        match self.archiver.archive(&self.path) {
            Ok(archived) => {
                observability::record_archive(true);
                if let Some(max_count) = self.archive_max_count {
                    if let Err(e) = self.archiver.prune(&self.path, max_count) {
                        warn!("Unable to prune flow configuration archive: {}", e);
                    }
                }
                Some(archived)
            }
            Err(e) => {
                observability::record_archive(false);
                warn!(
                    "Unable to archive flow configuration as requested due to {}",
                    e
                );
                debug!("Archive failure detail: {:?}", e);
                None
            }
        }
    }

    /// Run the serializer into a caller-supplied stream under the store lock
    pub fn serialize_to<S>(&self, serializer: &S, out: &mut dyn Write) -> Result<()>
    where
        S: FlowSerializer + ?Sized,
    {
        let _location = self.lock();
        serializer.serialize(out).map_err(serialization_error)
    }

    /// Apply `proposed` through the synchronizer, then persist it
    ///
    /// The document is only written when the synchronizer accepts it.
    pub fn synchronize<Y>(&self, synchronizer: &Y, proposed: &[u8]) -> Result<u64>
    where
        Y: FlowSynchronizer + ?Sized,
    {
        let location = self.lock();
        synchronizer
            .synchronize(proposed)
            .map_err(FlowStoreError::Synchronization)?;

        let written = write_atomic(&location, &self.compressor, &self.rename_policy, |out| {
            out.write_all(proposed)?;
            Ok(())
        })?;
        observability::record_save(written);
        Ok(written)
    }

    /// Archive the current document, reporting failures to the caller
    pub fn archive_now(&self) -> Result<PathBuf> {
        let _location = self.lock();
        let result = self.archiver.archive(&self.path);
        observability::record_archive(result.is_ok());
        result
    }

    /// Archive entries for this document, oldest first
    pub fn archives(&self) -> Result<Vec<ArchiveEntry>> {
        self.archiver.list(&self.path)
    }

    /// Keep only the newest `max_count` archive entries
    pub fn prune_archives(&self, max_count: usize) -> Result<Vec<PathBuf>> {
        self.archiver.prune(&self.path, max_count)
    }

    /// Atomically replace the document with the bytes of an archive entry
    pub fn restore_archive(&self, entry: &Path) -> Result<u64> {
        let mut source = File::open(entry).map_err(|e| FlowStoreError::archive(entry, e))?;
        let location = self.lock();
        let written = write_atomic(&location, &NoCompression, &self.rename_policy, |out| {
            io::copy(&mut source, out)?;
            Ok(())
        })?;
        debug!("Restored {} from {}", location.path().display(), entry.display());
        Ok(written)
    }
}

fn serialization_error(err: BoxError) -> FlowStoreError {
    // Failures writing into the sink are write errors, not serializer bugs
    match err.downcast::<io::Error>() {
        Ok(io_err) => FlowStoreError::Io(*io_err),
        Err(other) => FlowStoreError::Serialization(other),
    }
}
