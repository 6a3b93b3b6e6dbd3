//! Filesystem-backed save persistence: battery saves next to the ROM, written through a temp
//! file so an interrupted write never corrupts an existing save.

use nexen_common::frontend::SaveWriter;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SaveWriteError {
    #[error("error opening save file '{path}': {source}")]
    OpenFile {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("error reading save file '{path}': {source}")]
    ReadFile {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("error writing save file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to rename temp file '{temp_path}' to '{path}': {source}")]
    RenameFile {
        path: String,
        temp_path: String,
        #[source]
        source: io::Error,
    },
}

pub struct FsSaveWriter {
    base_path: PathBuf,
}

impl FsSaveWriter {
    #[must_use]
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn path_for(&self, extension: &str) -> PathBuf {
        self.base_path.with_extension(extension)
    }
}

impl SaveWriter for FsSaveWriter {
    type Err = SaveWriteError;

    fn load_bytes(&mut self, extension: &str) -> Result<Vec<u8>, Self::Err> {
        let path = self.path_for(extension);
        let mut file = File::open(&path).map_err(|source| SaveWriteError::OpenFile {
            path: path.display().to_string(),
            source,
        })?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(|source| SaveWriteError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        Ok(bytes)
    }

    fn persist_bytes(&mut self, extension: &str, bytes: &[u8]) -> Result<(), Self::Err> {
        let path = self.path_for(extension);
        let temp_path = self.path_for(&format!("{extension}.tmp"));

        {
            let mut file =
                File::create(&temp_path).map_err(|source| SaveWriteError::OpenFile {
                    path: temp_path.display().to_string(),
                    source,
                })?;
            file.write_all(bytes).map_err(|source| SaveWriteError::WriteFile {
                path: temp_path.display().to_string(),
                source,
            })?;
        }

        std::fs::rename(&temp_path, &path).map_err(|source| SaveWriteError::RenameFile {
            path: path.display().to_string(),
            temp_path: temp_path.display().to_string(),
            source,
        })?;

        Ok(())
    }
}
