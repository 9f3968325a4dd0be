use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};

#[derive(Debug)]
pub struct OutputFile {
    path: PathBuf,
    file: File,
}

impl OutputFile {
    pub fn prepare(path: &Path, total_bytes: Option<u64>, keep_existing: bool) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| CoreError::Io(err.to_string()))?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(!keep_existing)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| CoreError::Io(err.to_string()))?;
        if let Some(total) = total_bytes {
            file.set_len(total)
                .map_err(|err| CoreError::Io(err.to_string()))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn existing_len(path: &Path) -> Option<u64> {
        fs::metadata(path)
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn writer_at(&self, offset: u64) -> CoreResult<ChunkWriter> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|err| CoreError::Io(err.to_string()))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| CoreError::Io(err.to_string()))?;
        Ok(ChunkWriter { file, offset })
    }

    /// Forces written data to disk. A checkpoint must only be saved after
    /// this returns.
    pub fn sync(&self) -> CoreResult<()> {
        self.file
            .sync_data()
            .map_err(|err| CoreError::Io(err.to_string()))
    }
}

#[derive(Debug)]
pub struct ChunkWriter {
    file: File,
    offset: u64,
}

impl ChunkWriter {
    pub fn write_block(&mut self, block: &[u8]) -> CoreResult<()> {
        self.file
            .write_all(block)
            .map_err(|err| CoreError::Io(err.to_string()))?;
        self.offset += block.len() as u64;
        Ok(())
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}
