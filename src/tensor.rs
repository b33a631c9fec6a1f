//! `.tensor` files and atomic file replacement.
//!
//! A tensor file is a bincode-serialized `Array2<f32>`. Every file of the caches is first
//! written under a temporary name next to its destination, then renamed, so a reader never
//! sees a half-written file.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use ndarray::Array2;

use crate::error::{io_at, DatasetError, Result};

pub fn read_tensor(path: &Path) -> Result<Array2<f32>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(DatasetError::CacheMiss {
                path: path.to_path_buf(),
            });
        }
        Err(err) => return Err(io_at(path)(err)),
    };
    Ok(bincode::deserialize_from(BufReader::new(file))?)
}

pub fn write_tensor(path: &Path, tensor: &Array2<f32>) -> Result<()> {
    write_atomically(path, |writer| Ok(bincode::serialize_into(writer, tensor)?))
}

/// Writes through `write` into a temporary file, then renames it to `path`.
pub(crate) fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let temp_path = temp_path_for(path);
    let file = File::create(&temp_path).map_err(io_at(&temp_path))?;
    let mut writer = BufWriter::new(file);
    write(&mut writer)?;
    writer.flush().map_err(io_at(&temp_path))?;
    drop(writer);
    fs::rename(&temp_path, path).map_err(io_at(path))?;
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Removes `dir` with everything inside (if it exists), then recreates it empty.
pub(crate) fn reset_dir(dir: &Path) -> Result<()> {
    remove_dir_if_exists(dir)?;
    fs::create_dir_all(dir).map_err(io_at(dir))
}

pub(crate) fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_at(dir)(err)),
    }
}
