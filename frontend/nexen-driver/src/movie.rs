//! Input movie recording and playback.
//!
//! A movie is a keyed-record file: a header (system, ROM CRC-32, controller count, rerecord
//! count), the per-frame per-port input records, and optionally the save state the recording
//! started from.

use bincode::{Decode, Encode};
use nexen_common::savestate::{SaveStateError, StateRecords};
use std::path::Path;
use thiserror::Error;

pub const MOVIE_FORMAT_VERSION: &str = "nexen-movie-1";

#[derive(Debug, Error)]
pub enum MovieError {
    #[error("error reading movie file: {0}")]
    Io(#[from] std::io::Error),
    #[error("error parsing movie file: {0}")]
    Format(#[from] SaveStateError),
    #[error("movie was recorded for a different ROM (movie CRC32 {movie:08X}, loaded {loaded:08X})")]
    RomMismatch { movie: u32, loaded: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct MovieHeader {
    pub system: String,
    pub rom_crc32: u32,
    pub controller_ports: u8,
    pub rerecord_count: u32,
}

#[derive(Debug, Clone)]
pub struct Movie {
    pub header: MovieHeader,
    /// `inputs[frame][port]`
    pub inputs: Vec<Vec<u16>>,
    pub initial_state: Option<Vec<u8>>,
}

impl Movie {
    #[must_use]
    pub fn new(system: String, rom_crc32: u32, controller_ports: u8) -> Self {
        Self {
            header: MovieHeader { system, rom_crc32, controller_ports, rerecord_count: 0 },
            inputs: Vec::new(),
            initial_state: None,
        }
    }

    pub fn record_frame(&mut self, port_bits: Vec<u16>) {
        self.inputs.push(port_bits);
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.inputs.len()
    }

    /// Serialize and write the movie file.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors.
    pub fn save(&self, path: &Path) -> Result<(), MovieError> {
        let mut records = StateRecords::new();
        records.push_serialized("movie.header", &self.header);
        records.push_serialized("movie.inputs", &self.inputs);
        if let Some(state) = &self.initial_state {
            records.push_bytes("movie.initial_state", state);
        }

        std::fs::write(path, records.to_bytes(MOVIE_FORMAT_VERSION))?;
        Ok(())
    }

    /// Read and parse a movie file, verifying it matches the loaded ROM.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, a malformed file, or a ROM mismatch.
    pub fn load(path: &Path, loaded_rom_crc32: u32) -> Result<Self, MovieError> {
        let bytes = std::fs::read(path)?;
        let records = StateRecords::from_bytes(&bytes, MOVIE_FORMAT_VERSION)?;

        let header: MovieHeader = records.decode("movie.header")?;
        if header.rom_crc32 != loaded_rom_crc32 {
            return Err(MovieError::RomMismatch {
                movie: header.rom_crc32,
                loaded: loaded_rom_crc32,
            });
        }

        let inputs: Vec<Vec<u16>> = records.decode("movie.inputs")?;
        let initial_state = records.bytes("movie.initial_state").ok().map(<[u8]>::to_vec);

        Ok(Self { header, inputs, initial_state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movie_round_trip() {
        let mut movie = Movie::new("Nes".into(), 0xDEADBEEF, 2);
        movie.record_frame(vec![0x01, 0x00]);
        movie.record_frame(vec![0x03, 0x80]);

        let dir = std::env::temp_dir().join("nexen-movie-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.nxm");
        movie.save(&path).unwrap();

        let loaded = Movie::load(&path, 0xDEADBEEF).unwrap();
        assert_eq!(loaded.header, movie.header);
        assert_eq!(loaded.inputs, movie.inputs);
        assert!(loaded.initial_state.is_none());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rom_mismatch_rejected() {
        let movie = Movie::new("Nes".into(), 0x11111111, 2);

        let dir = std::env::temp_dir().join("nexen-movie-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mismatch.nxm");
        movie.save(&path).unwrap();

        assert!(matches!(
            Movie::load(&path, 0x22222222),
            Err(MovieError::RomMismatch { .. })
        ));

        std::fs::remove_file(&path).ok();
    }
}
