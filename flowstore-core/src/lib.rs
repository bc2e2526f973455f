/*!
# Flowstore Core

Crash-safe persistence for a single flow configuration document.

The primary document is a gzip stream on the local filesystem. It is never
observed half-written:

- Saves stream into a sibling temporary file, sync it, then replace the
  primary in one rename (retried with backoff if another process holds the file)
- Every load and save runs under one exclusive lock owned by the store
- After a save, the committed document can be copied into a timestamped
  archive entry; archiving is best-effort and never fails the save

The document format itself is opaque here. Callers supply a
[`FlowSerializer`] that writes the uncompressed bytes.

## Usage

```rust,no_run
use flowstore_core::{serializer_fn, FlowConfigurationStore, StorageConfig};

let config = StorageConfig::new("/var/lib/flow/flow.xml.gz").with_archive_max_count(20);
let store = FlowConfigurationStore::from_config(&config)?;

let serializer = serializer_fn(|out| {
    out.write_all(b"<flowController/>")?;
    Ok(())
});

// Atomic save followed by an archive copy
let archived = store.save_document(&serializer, true)?;

// Read it back, decompressed
let document = store.load_bytes()?;
# Ok::<(), flowstore_core::FlowStoreError>(())
```
*/

pub mod archive;
pub mod compression;
pub mod config;
pub mod error;
pub mod location;
pub mod observability;
pub mod storage;
pub mod writer;


pub use archive::{ArchiveEntry, ArchiveManager};
pub use compression::{CompressionAdapter, FinishWrite, GzipCompressor, NoCompression};
pub use config::{RenamePolicy, StorageConfig};
pub use error::{BoxError, ErrorKind, FlowStoreError, Result};
pub use location::StorageLocation;
pub use storage::{
    serializer_fn, synchronizer_fn, BytesSerializer, FlowConfigurationStore, FlowSerializer,
    FlowSynchronizer,
};
pub use writer::{write_atomic, AtomicWriter};
