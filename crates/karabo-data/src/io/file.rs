//! File I/O for Hash and Schema.
//!
//! The codec is chosen from the extension (`.xml` or `.bin`). Writes go to
//! a temporary sibling file which is synced and renamed over the target.

use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::debug;
use uuid::Uuid;

use crate::errors::{KaraboError, Result};
use crate::hash::Hash;
use crate::schema::Schema;

use super::{BinarySerializer, HashSerializer, XmlSerializer};

fn serializer_for(path: &Path) -> Result<Box<dyn HashSerializer>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("xml") => Ok(Box::new(XmlSerializer::new())),
        Some(ext) if ext.eq_ignore_ascii_case("bin") => Ok(Box::new(BinarySerializer::new())),
        _ => Err(KaraboError::Io(format!(
            "cannot choose a format for '{}' (expected .xml or .bin)",
            path.display()
        ))),
    }
}

fn io_error(path: &Path, e: std::io::Error) -> KaraboError {
    KaraboError::Io(format!("{}: {e}", path.display()))
}

fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = parent {
        fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| KaraboError::Io(format!("'{}' has no file name", path.display())))?;
    let temp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&temp);
        return Err(io_error(path, e));
    }
    debug!(path = %path.display(), bytes = data.len(), "wrote file");
    Ok(())
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| io_error(path, e))
}

/// Save a Hash; the format follows the extension.
pub fn save_to_file(hash: &Hash, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let data = serializer_for(path)?.save(hash)?;
    write_atomically(path, &data)
}

/// Load a Hash saved by [`save_to_file`].
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Hash> {
    let path = path.as_ref();
    let serializer = serializer_for(path)?;
    serializer.load(&read(path)?)
}

pub fn save_schema_to_file(schema: &Schema, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let data = serializer_for(path)?.save_schema(schema)?;
    write_atomically(path, &data)
}

pub fn load_schema_from_file(path: impl AsRef<Path>) -> Result<Schema> {
    let path = path.as_ref();
    let serializer = serializer_for(path)?;
    serializer.load_schema(&read(path)?)
}
