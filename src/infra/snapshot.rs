//! Flat binary snapshot of the whole registry.
//!
//! The store is stateless: every [`save`] rewrites the complete image and
//! every [`load`] reads one back. Saves go to a sibling `.tmp` file that is
//! synced and then renamed over the target, so readers only ever see a whole
//! image.
//!
//! # Format
//! ```text
//! [Header]
//! - Magic: "LOTW" (4 bytes)
//! - Version: u32
//! [Registry]
//! - capacity: u64
//! - occupied: u64
//! - small rate: f64
//! - large rate: f64
//! - record count: u64
//! [Record] x record count
//! - key length: u32, key bytes (UTF-8)
//! - category length: u32, category bytes (UTF-8)
//! - admitted at: i64
//! - released at: i64 (i64::MIN while present)
//! - fee: f64
//! ```
//! All integers and floats are little-endian.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::core::{OccupantRecord, RateTable};

const MAGIC: &[u8; 4] = b"LOTW";
const FORMAT_VERSION: u32 = 1;
const RELEASE_SENTINEL: i64 = i64::MIN;

/// Errors raised while reading or writing a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Underlying file I/O failed.
    #[error("snapshot I/O: {0}")]
    Io(#[from] io::Error),
    /// The file does not start with the expected magic bytes.
    #[error("invalid snapshot magic: {0:?}")]
    InvalidMagic([u8; 4]),
    /// The file was written by an unknown format version.
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    /// The content is structurally readable but inconsistent.
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
}

/// Point-in-time image of registry state.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotImage {
    /// Total slots.
    pub capacity: usize,
    /// Slots in use; must equal the number of present records.
    pub occupied: usize,
    /// Hourly rates.
    pub rates: RateTable,
    /// Present and released records.
    pub records: Vec<OccupantRecord>,
}

/// Serialize `image` into `writer`.
///
/// # Errors
///
/// Propagates any write failure.
pub fn write_image<W: Write>(writer: &mut W, image: &SnapshotImage) -> io::Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_u32::<LittleEndian>(FORMAT_VERSION)?;
    writer.write_u64::<LittleEndian>(image.capacity as u64)?;
    writer.write_u64::<LittleEndian>(image.occupied as u64)?;
    writer.write_f64::<LittleEndian>(image.rates.small)?;
    writer.write_f64::<LittleEndian>(image.rates.large)?;
    writer.write_u64::<LittleEndian>(image.records.len() as u64)?;

    for record in &image.records {
        write_str(writer, &record.key)?;
        write_str(writer, record.category.as_str())?;
        writer.write_i64::<LittleEndian>(record.admitted_at)?;
        writer.write_i64::<LittleEndian>(record.released_at.unwrap_or(RELEASE_SENTINEL))?;
        writer.write_f64::<LittleEndian>(record.fee)?;
    }
    Ok(())
}

fn write_str<W: Write>(writer: &mut W, s: &str) -> io::Result<()> {
    let len = u32::try_from(s.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string too long for snapshot"))?;
    writer.write_u32::<LittleEndian>(len)?;
    writer.write_all(s.as_bytes())
}

/// Serialize `image` into a fresh buffer.
///
/// # Errors
///
/// Fails only when a string is longer than `u32::MAX` bytes.
pub fn encode(image: &SnapshotImage) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(44 + image.records.len() * 48);
    write_image(&mut buf, image)?;
    Ok(buf)
}

/// Parse and validate a snapshot held in memory.
///
/// # Errors
///
/// Returns an error for truncated input, bad magic or version, and images
/// that break registry invariants.
pub fn decode(bytes: &[u8]) -> Result<SnapshotImage, SnapshotError> {
    let mut cur = Cursor::new(bytes);

    let mut magic = [0u8; 4];
    cur.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(SnapshotError::InvalidMagic(magic));
    }
    let version = cur.read_u32::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }

    let capacity = read_len(&mut cur)?;
    let occupied = read_len(&mut cur)?;
    let small = cur.read_f64::<LittleEndian>()?;
    let large = cur.read_f64::<LittleEndian>()?;
    let rates = RateTable::new(small, large)
        .ok_or_else(|| SnapshotError::Corrupt(format!("invalid rates {small}/{large}")))?;
    let count = read_len(&mut cur)?;

    if capacity == 0 {
        return Err(SnapshotError::Corrupt("capacity is zero".into()));
    }

    let mut records = Vec::with_capacity(count.min(bytes.len() / 32));
    let mut present = HashSet::new();
    for _ in 0..count {
        let key = read_str(&mut cur)?;
        let category = read_str(&mut cur)?
            .parse()
            .map_err(SnapshotError::Corrupt)?;
        let admitted_at = cur.read_i64::<LittleEndian>()?;
        let released_at = match cur.read_i64::<LittleEndian>()? {
            RELEASE_SENTINEL => None,
            t => Some(t),
        };
        let fee = cur.read_f64::<LittleEndian>()?;

        if released_at.is_none() && !present.insert(key.clone()) {
            return Err(SnapshotError::Corrupt(format!("key `{key}` present twice")));
        }
        records.push(OccupantRecord {
            key,
            category,
            admitted_at,
            released_at,
            fee,
        });
    }

    if (cur.position() as usize) != bytes.len() {
        return Err(SnapshotError::Corrupt("trailing bytes".into()));
    }
    if present.len() != occupied {
        return Err(SnapshotError::Corrupt(format!(
            "occupied count {occupied} does not match {} present records",
            present.len()
        )));
    }
    if occupied > capacity {
        return Err(SnapshotError::Corrupt(format!(
            "occupied count {occupied} exceeds capacity {capacity}"
        )));
    }

    Ok(SnapshotImage {
        capacity,
        occupied,
        rates,
        records,
    })
}

fn read_len(cur: &mut Cursor<&[u8]>) -> Result<usize, SnapshotError> {
    let raw = cur.read_u64::<LittleEndian>()?;
    usize::try_from(raw).map_err(|_| SnapshotError::Corrupt(format!("length {raw} out of range")))
}

fn read_str(cur: &mut Cursor<&[u8]>) -> Result<String, SnapshotError> {
    let len = cur.read_u32::<LittleEndian>()? as usize;
    let remaining = cur.get_ref().len().saturating_sub(cur.position() as usize);
    if len > remaining {
        return Err(SnapshotError::Corrupt(format!(
            "string length {len} exceeds remaining {remaining} bytes"
        )));
    }
    let mut buf = vec![0u8; len];
    cur.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| SnapshotError::Corrupt(e.to_string()))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Write `image` to `path`, replacing any previous snapshot atomically.
///
/// # Errors
///
/// Returns [`SnapshotError::Io`] if the temp file cannot be written or renamed.
pub fn save(path: &Path, image: &SnapshotImage) -> Result<(), SnapshotError> {
    let tmp = temp_path(path);
    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        write_image(&mut writer, image)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read the snapshot at `path`.
///
/// # Errors
///
/// Missing files surface as [`SnapshotError::Io`]; see [`decode`] for the rest.
pub fn load(path: &Path) -> Result<SnapshotImage, SnapshotError> {
    let bytes = fs::read(path)?;
    decode(&bytes)
}
