//! File-backed spill medium.
//!
//! Items are written to a temporary file using MessagePack as a data serialization format.
//! For more information see https://msgpack.org/.

use std::fs;
use std::io;
use std::io::prelude::*;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log;
use tempfile;

use crate::error::{Error, Result};
use crate::resource::{Resource, ResourceTracker, Token};
use crate::storage::{Accumulator, Backing, Collection, Item, Medium, SpillFactory};

/// Creates [`FileAccumulator`]s in a directory.
pub struct FileSpill {
    dir: PathBuf,
    rw_buf_size: Option<usize>,
    tracker: ResourceTracker,
    owned_dir: Option<Arc<tempfile::TempDir>>,
}

impl FileSpill {
    /// # Arguments
    /// * `dir` - Directory temporary files are created in
    /// * `rw_buf_size` - File read/write buffer size
    /// * `tracker` - Registry the file resources are reported to
    pub fn new(dir: &Path, rw_buf_size: Option<usize>, tracker: ResourceTracker) -> Self {
        FileSpill {
            dir: dir.to_path_buf(),
            rw_buf_size,
            tracker,
            owned_dir: None,
        }
    }

    /// Creates files in a temporary directory removed once the spill and every file in it are gone.
    pub fn in_temp_dir(dir: Arc<tempfile::TempDir>, rw_buf_size: Option<usize>, tracker: ResourceTracker) -> Self {
        FileSpill {
            dir: dir.path().to_path_buf(),
            rw_buf_size,
            tracker,
            owned_dir: Some(dir),
        }
    }
}

impl<T: Item> SpillFactory<T> for FileSpill {
    fn open(&self) -> Result<Box<dyn Accumulator<T>>> {
        let accumulator = FileAccumulator::create(&self.dir, self.rw_buf_size, &self.tracker, self.owned_dir.clone())?;
        Ok(Box::new(accumulator))
    }

    fn medium(&self) -> Medium {
        Medium::File
    }
}

/// Accumulator writing items to a temporary file.
///
/// The file is deleted once the accumulator and every collection and cursor over it are gone.
pub struct FileAccumulator<T> {
    writer: Option<io::BufWriter<fs::File>>,
    path: PathBuf,
    rw_buf_size: Option<usize>,
    resource: Resource,
    token: Token,
    count: usize,

    item_type: PhantomData<T>,
}

impl<T> FileAccumulator<T> {
    pub fn new(dir: &Path, rw_buf_size: Option<usize>, tracker: &ResourceTracker) -> Result<Self> {
        Self::create(dir, rw_buf_size, tracker, None)
    }

    fn create(
        dir: &Path,
        rw_buf_size: Option<usize>,
        tracker: &ResourceTracker,
        dir_guard: Option<Arc<tempfile::TempDir>>,
    ) -> Result<Self> {
        let tmp_file = tempfile::Builder::new()
            .prefix("spill-")
            .tempfile_in(dir)
            .map_err(|err| Error::backend(format!("spill file creation in {} failed", dir.display()), err))?;
        let (file, tmp_path) = tmp_file.into_parts();
        let path = tmp_path.to_path_buf();

        let resource = Resource::new(path.display().to_string(), tracker, move || {
            let deleted = tmp_path.close().map_err(|err| err.into());
            // the directory goes away only after its last file
            drop(dir_guard);
            deleted
        });
        let token = resource.acquire()?;

        let writer = match rw_buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };
        log::debug!("spill file {} created", path.display());

        return Ok(FileAccumulator {
            writer: Some(writer),
            path,
            rw_buf_size,
            resource,
            token,
            count: 0,
            item_type: PhantomData,
        });
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: Item> Accumulator<T> for FileAccumulator<T> {
    fn add(&mut self, item: T) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(Error::AlreadySealed)?;
        rmp_serde::encode::write(writer, &item)
            .map_err(|err| Error::backend(format!("spill file {} write failed", self.path.display()), err))?;
        self.count += 1;
        return Ok(());
    }

    fn count(&self) -> usize {
        self.count
    }

    fn medium(&self) -> Medium {
        Medium::File
    }

    fn complete(&mut self) -> Result<Collection<T>> {
        let mut writer = self.writer.take().ok_or(Error::AlreadySealed)?;
        writer
            .flush()
            .map_err(|err| Error::backend(format!("spill file {} flush failed", self.path.display()), err))?;
        drop(writer);

        log::debug!("spill file {} sealed with {} items", self.path.display(), self.count);
        let backing = Arc::new(FileBacking {
            path: self.path.clone(),
            rw_buf_size: self.rw_buf_size,
            item_type: PhantomData,
        });

        Collection::new(backing, self.resource.clone(), self.count)
    }
}

impl<T> Drop for FileAccumulator<T> {
    fn drop(&mut self) {
        // close the handle before the last token may delete the file
        self.writer = None;
        if let Err(err) = self.token.release() {
            log::error!("spill file {} cleanup failed: {}", self.path.display(), err);
        }
    }
}

struct FileBacking<T> {
    path: PathBuf,
    rw_buf_size: Option<usize>,

    item_type: PhantomData<fn() -> T>,
}

impl<T: Item> Backing<T> for FileBacking<T> {
    fn open(&self) -> Result<Box<dyn Iterator<Item = Result<T>>>> {
        let context = || format!("spill file {} open failed", self.path.display());
        let file = fs::File::open(&self.path).map_err(|err| Error::backend(context(), err))?;
        let file_len = file.metadata().map_err(|err| Error::backend(context(), err))?.len();

        let reader = match self.rw_buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        Ok(Box::new(FileReader::<T>::new(reader.take(file_len))))
    }

    fn medium(&self) -> Medium {
        Medium::File
    }
}

/// MessagePack reader of a spill file.
pub struct FileReader<T> {
    reader: io::Take<io::BufReader<fs::File>>,
    failed: bool,

    item_type: PhantomData<T>,
}

impl<T> FileReader<T> {
    fn new(reader: io::Take<io::BufReader<fs::File>>) -> Self {
        FileReader {
            reader,
            failed: false,
            item_type: PhantomData,
        }
    }
}

impl<T: Item> Iterator for FileReader<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.reader.limit() == 0 {
            None
        } else {
            match rmp_serde::decode::from_read(&mut self.reader) {
                Ok(result) => Some(Ok(result)),
                Err(err) => {
                    self.failed = true;
                    Some(Err(Error::DeserializationError(err)))
                }
            }
        }
    }
}
