//! The save-state container format.
//!
//! A save state is a flat sequence of keyed binary records:
//!
//! ```text
//! <name-length:u8> <name:bytes> <type-tag:u8> <payload-length:varint> <payload:bytes>
//! ```
//!
//! Component states are bincode-encoded payloads keyed by path-prefixed names ("nes.cpu",
//! "nes.ppu.oam", ...). The first record is always the format version and the final record is a
//! CRC-32 of everything before it. Records with unknown names are skipped on load so that newer
//! versions can add components without breaking older readers; a version mismatch or checksum
//! mismatch fails the load without touching the running console.

use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use crc::{CRC_32_ISO_HDLC, Crc};
use thiserror::Error;

const MAGIC: [u8; 4] = *b"NXST";

const VERSION_RECORD: &str = "meta.version";
const CRC_RECORD: &str = "meta.crc32";

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

macro_rules! bincode_config {
    () => {
        bincode::config::standard().with_little_endian().with_variable_int_encoding()
    };
}

#[derive(Debug, Error)]
pub enum SaveStateError {
    #[error("not a save state file (bad magic bytes)")]
    InvalidMagic,
    #[error("save state truncated while reading {context}")]
    UnexpectedEof { context: &'static str },
    #[error("save state record name is not valid UTF-8")]
    InvalidRecordName,
    #[error("save state version mismatch: file has '{actual}', expected '{expected}'")]
    VersionMismatch { expected: String, actual: String },
    #[error("save state checksum mismatch: computed {computed:08X}, stored {stored:08X}")]
    ChecksumMismatch { computed: u32, stored: u32 },
    #[error("save state is missing required record '{0}'")]
    MissingRecord(String),
    #[error("error decoding save state record '{name}': {source}")]
    Decode {
        name: String,
        #[source]
        source: DecodeError,
    },
    #[error("error encoding save state record '{name}': {source}")]
    Encode {
        name: String,
        #[source]
        source: EncodeError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeTag {
    Bincode,
    Raw,
    Utf8,
}

impl TypeTag {
    fn to_byte(self) -> u8 {
        match self {
            Self::Bincode => 0,
            Self::Raw => 1,
            Self::Utf8 => 2,
        }
    }

    fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::Raw,
            2 => Self::Utf8,
            // Unknown tags decode as opaque bincode blobs; they only matter to readers that
            // know the record name anyway
            _ => Self::Bincode,
        }
    }
}

#[derive(Debug, Clone)]
struct StateRecord {
    name: String,
    tag: TypeTag,
    payload: Vec<u8>,
}

/// An in-memory, ordered collection of keyed records.
#[derive(Debug, Clone, Default)]
pub struct StateRecords {
    records: Vec<StateRecord>,
}

impl StateRecords {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a bincode-encoded record.
    ///
    /// # Panics
    ///
    /// Panics if the value fails to encode, which only happens for types whose `Encode`
    /// implementation can fail (none of the component state types can).
    pub fn push_serialized<E: Encode>(&mut self, name: &str, value: &E) {
        let payload = bincode::encode_to_vec(value, bincode_config!())
            .unwrap_or_else(|err| panic!("failed to encode state record '{name}': {err}"));
        self.records.push(StateRecord { name: name.into(), tag: TypeTag::Bincode, payload });
    }

    pub fn push_bytes(&mut self, name: &str, bytes: &[u8]) {
        self.records.push(StateRecord {
            name: name.into(),
            tag: TypeTag::Raw,
            payload: bytes.into(),
        });
    }

    pub fn push_str(&mut self, name: &str, value: &str) {
        self.records.push(StateRecord {
            name: name.into(),
            tag: TypeTag::Utf8,
            payload: value.as_bytes().into(),
        });
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.records.iter().any(|record| record.name == name)
    }

    fn find(&self, name: &str) -> Option<&StateRecord> {
        self.records.iter().find(|record| record.name == name)
    }

    /// Decode the bincode payload of the named record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing or its payload fails to decode.
    pub fn decode<D: Decode<()>>(&self, name: &str) -> Result<D, SaveStateError> {
        let record =
            self.find(name).ok_or_else(|| SaveStateError::MissingRecord(name.into()))?;
        let (value, _) = bincode::decode_from_slice(&record.payload, bincode_config!())
            .map_err(|source| SaveStateError::Decode { name: name.into(), source })?;
        Ok(value)
    }

    /// Return the raw payload of the named record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing.
    pub fn bytes(&self, name: &str) -> Result<&[u8], SaveStateError> {
        self.find(name)
            .map(|record| record.payload.as_slice())
            .ok_or_else(|| SaveStateError::MissingRecord(name.into()))
    }

    /// Return the UTF-8 payload of the named record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing or not valid UTF-8.
    pub fn str(&self, name: &str) -> Result<&str, SaveStateError> {
        let record =
            self.find(name).ok_or_else(|| SaveStateError::MissingRecord(name.into()))?;
        std::str::from_utf8(&record.payload).map_err(|_| SaveStateError::InvalidRecordName)
    }

    /// Serialize all records into the on-disk format, prepending the version record and
    /// appending the CRC-32 trailer.
    #[must_use]
    pub fn to_bytes(&self, version: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            MAGIC.len() + self.records.iter().map(|r| r.payload.len() + 32).sum::<usize>(),
        );
        out.extend_from_slice(&MAGIC);

        write_record(&mut out, VERSION_RECORD, TypeTag::Utf8, version.as_bytes());
        for record in &self.records {
            write_record(&mut out, &record.name, record.tag, &record.payload);
        }

        let checksum = CRC32.checksum(&out);
        write_record(&mut out, CRC_RECORD, TypeTag::Raw, &checksum.to_le_bytes());

        out
    }

    /// Parse the on-disk format, verifying magic bytes, version, and checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are malformed, the version does not match, or the checksum
    /// does not match.
    pub fn from_bytes(bytes: &[u8], expected_version: &str) -> Result<Self, SaveStateError> {
        let Some(body) = bytes.strip_prefix(&MAGIC) else {
            return Err(SaveStateError::InvalidMagic);
        };

        let mut records = Vec::new();
        let mut cursor = body;
        let mut bytes_consumed = MAGIC.len();
        let mut stored_crc = None;

        while !cursor.is_empty() {
            let record_start = bytes_consumed;
            let (record, rest) = read_record(cursor)?;
            bytes_consumed += cursor.len() - rest.len();
            cursor = rest;

            if record.name == CRC_RECORD {
                let payload: [u8; 4] = record.payload.as_slice().try_into().map_err(|_| {
                    SaveStateError::UnexpectedEof { context: "checksum record" }
                })?;
                stored_crc = Some((u32::from_le_bytes(payload), record_start));
                break;
            }

            records.push(record);
        }

        let Some((stored, crc_offset)) = stored_crc else {
            return Err(SaveStateError::UnexpectedEof { context: "checksum record" });
        };
        let computed = CRC32.checksum(&bytes[..crc_offset]);
        if computed != stored {
            return Err(SaveStateError::ChecksumMismatch { computed, stored });
        }

        let state = Self { records };
        let actual_version = state.str(VERSION_RECORD)?;
        if actual_version != expected_version {
            return Err(SaveStateError::VersionMismatch {
                expected: expected_version.into(),
                actual: actual_version.into(),
            });
        }

        Ok(state)
    }
}

fn write_record(out: &mut Vec<u8>, name: &str, tag: TypeTag, payload: &[u8]) {
    debug_assert!(name.len() <= u8::MAX as usize, "record name too long: {name}");

    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
    out.push(tag.to_byte());
    write_varint(out, payload.len() as u64);
    out.extend_from_slice(payload);
}

fn read_record(bytes: &[u8]) -> Result<(StateRecord, &[u8]), SaveStateError> {
    let (&name_len, rest) = bytes
        .split_first()
        .ok_or(SaveStateError::UnexpectedEof { context: "record name length" })?;

    let name_len = usize::from(name_len);
    if rest.len() < name_len {
        return Err(SaveStateError::UnexpectedEof { context: "record name" });
    }
    let (name_bytes, rest) = rest.split_at(name_len);
    let name =
        std::str::from_utf8(name_bytes).map_err(|_| SaveStateError::InvalidRecordName)?.to_owned();

    let (&tag_byte, rest) =
        rest.split_first().ok_or(SaveStateError::UnexpectedEof { context: "record type tag" })?;

    let (payload_len, rest) = read_varint(rest)?;
    let payload_len = payload_len as usize;
    if rest.len() < payload_len {
        return Err(SaveStateError::UnexpectedEof { context: "record payload" });
    }
    let (payload, rest) = rest.split_at(payload_len);

    Ok((
        StateRecord { name, tag: TypeTag::from_byte(tag_byte), payload: payload.into() },
        rest,
    ))
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(mut bytes: &[u8]) -> Result<(u64, &[u8]), SaveStateError> {
    let mut value = 0_u64;
    let mut shift = 0_u32;

    loop {
        let (&byte, rest) = bytes
            .split_first()
            .ok_or(SaveStateError::UnexpectedEof { context: "varint payload length" })?;
        bytes = rest;

        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, bytes));
        }

        shift += 7;
        if shift >= 64 {
            return Err(SaveStateError::UnexpectedEof { context: "varint payload length" });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
    struct FakeCpu {
        pc: u16,
        a: u8,
        cycles: u64,
    }

    #[test]
    fn round_trip() {
        let cpu = FakeCpu { pc: 0x8000, a: 0x42, cycles: 123_456_789 };

        let mut records = StateRecords::new();
        records.push_serialized("nes.cpu", &cpu);
        records.push_bytes("nes.sram", &[1, 2, 3]);
        let bytes = records.to_bytes("1.0");

        let parsed = StateRecords::from_bytes(&bytes, "1.0").unwrap();
        let decoded: FakeCpu = parsed.decode("nes.cpu").unwrap();
        assert_eq!(decoded, cpu);
        assert_eq!(parsed.bytes("nes.sram").unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn version_mismatch_rejected() {
        let records = StateRecords::new();
        let bytes = records.to_bytes("1.0");

        assert!(matches!(
            StateRecords::from_bytes(&bytes, "2.0"),
            Err(SaveStateError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn corruption_rejected() {
        let mut records = StateRecords::new();
        records.push_bytes("payload", &[0xAA; 64]);
        let mut bytes = records.to_bytes("1.0");

        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;

        assert!(matches!(
            StateRecords::from_bytes(&bytes, "1.0"),
            Err(SaveStateError::ChecksumMismatch { .. } | SaveStateError::UnexpectedEof { .. })
                | Err(SaveStateError::InvalidRecordName)
        ));
    }

    #[test]
    fn unknown_records_ignored() {
        let mut records = StateRecords::new();
        records.push_bytes("future.component", &[1, 2, 3]);
        records.push_str("known", "value");
        let bytes = records.to_bytes("1.0");

        let parsed = StateRecords::from_bytes(&bytes, "1.0").unwrap();
        assert_eq!(parsed.str("known").unwrap(), "value");
    }

    #[test]
    fn varint_round_trip() {
        for value in [0_u64, 1, 127, 128, 300, 16_384, u32::MAX as u64, u64::MAX] {
            let mut bytes = Vec::new();
            write_varint(&mut bytes, value);
            let (decoded, rest) = read_varint(&bytes).unwrap();
            assert_eq!(decoded, value);
            assert!(rest.is_empty());
        }
    }
}
