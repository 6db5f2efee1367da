//! Binary dump file format and the crash-safe write registry.
//!
//! Layout (all multi-byte integers big-endian, floats IEEE-754 bit-cast
//! then big-endian, strings length-prefixed `u64` then raw bytes):
//!
//! | offset | field                        | size |
//! |--------|------------------------------|------|
//! | 0      | version (=1)                 | u8   |
//! | 1      | type tag                     | u8   |
//! | 2      | CRC-32 of body                | u32  |
//! | 6      | expiration epoch              | u64  |
//! | 14     | 32-byte magic identifier      | 32 B |
//! | 46     | body                          | n B  |
//!
//! The writer streams the header with checksum=0, then the body, updating
//! a running CRC-32 as it goes; on close it seeks back to offset 2 and
//! backpatches the final checksum. A process-wide registry records every
//! dump that is open for writing; on a fatal exit path the registry is
//! "burned" — every still-open file is closed and unlinked, so only
//! fully-finalized dumps ever survive a crash.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::error::{HoarderError, Result};

pub const DUMP_VERSION: u8 = 1;
pub const DUMP_MAGIC: [u8; 32] = *b"EVEMARKETHOARDERDUMPv1\0\0\0\0\0\0\0\0\0\0";
const BODY_OFFSET: u64 = 46;
const CHECKSUM_OFFSET: u64 = 2;
const REGISTRY_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpType {
    Locations = 0,
    Orders = 1,
    Histories = 2,
    Internal = 3,
}

impl DumpType {
    fn tag(self) -> u8 {
        self as u8
    }
}

/// Process-wide registry of in-progress dump writes. On any fatal exit
/// path (panic, assertion failure, signal-triggered shutdown), call
/// [`DumpRegistry::burn`] to close and unlink every still-open file so no
/// half-written dump is ever mistaken for a finished one.
pub struct DumpRegistry {
    entries: Mutex<HashMap<u64, RegistryEntry>>,
    next_id: AtomicU64,
}

struct RegistryEntry {
    path: PathBuf,
    file: File,
}

impl DumpRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(REGISTRY_CAPACITY)),
            next_id: AtomicU64::new(0),
        }
    }

    fn register(&self, path: PathBuf, file: File) -> u64 {
        let mut entries = self.entries.lock().expect("dump registry mutex poisoned");
        assert!(
            entries.len() < REGISTRY_CAPACITY,
            "dump registry capacity exceeded"
        );
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.insert(id, RegistryEntry { path, file });
        id
    }

    fn unregister(&self, id: u64) -> Option<File> {
        let mut entries = self.entries.lock().expect("dump registry mutex poisoned");
        entries.remove(&id).map(|entry| entry.file)
    }

    fn with_file<R>(&self, id: u64, f: impl FnOnce(&mut File) -> std::io::Result<R>) -> Result<R> {
        let mut entries = self.entries.lock().expect("dump registry mutex poisoned");
        let entry = entries
            .get_mut(&id)
            .expect("dump writer id missing from registry");
        Ok(f(&mut entry.file)?)
    }

    /// Close and unlink every file still open for writing. Safe to call
    /// more than once; a clean shutdown that already closed every writer
    /// leaves nothing to burn.
    pub fn burn(&self) {
        let mut entries = self.entries.lock().expect("dump registry mutex poisoned");
        for (_, entry) in entries.drain() {
            warn!(
                path = %entry.path.display(),
                "store was closed while writing; removing file to avoid a corrupted dump"
            );
            drop(entry.file);
            if let Err(err) = std::fs::remove_file(&entry.path) {
                tracing::error!(path = %entry.path.display(), %err, "failed to unlink dump file during burn");
            }
        }
    }

    pub fn open_count(&self) -> usize {
        self.entries.lock().expect("dump registry mutex poisoned").len()
    }
}

impl Default for DumpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A dump file open for writing. Every body write updates a running
/// CRC-32; `close` backpatches the final checksum at offset 2.
pub struct DumpWriter<'r> {
    registry: &'r DumpRegistry,
    id: u64,
    checksum: crc32fast::Hasher,
}

impl<'r> DumpWriter<'r> {
    pub fn open(
        registry: &'r DumpRegistry,
        path: impl AsRef<Path>,
        dump_type: DumpType,
        expiration_epoch: u64,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        file.write_all(&[DUMP_VERSION, dump_type.tag()])?;
        file.write_all(&0u32.to_be_bytes())?; // checksum placeholder
        file.write_all(&expiration_epoch.to_be_bytes())?;
        file.write_all(&DUMP_MAGIC)?;

        let id = registry.register(path, file);
        Ok(Self {
            registry,
            id,
            checksum: crc32fast::Hasher::new(),
        })
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.registry.with_file(self.id, |file| file.write_all(buf))?;
        self.checksum.update(buf);
        Ok(())
    }

    pub fn write_u8(&mut self, n: u8) -> Result<()> {
        self.write_bytes(&[n])
    }

    pub fn write_u16(&mut self, n: u16) -> Result<()> {
        self.write_bytes(&n.to_be_bytes())
    }

    pub fn write_u32(&mut self, n: u32) -> Result<()> {
        self.write_bytes(&n.to_be_bytes())
    }

    pub fn write_u64(&mut self, n: u64) -> Result<()> {
        self.write_bytes(&n.to_be_bytes())
    }

    pub fn write_i8(&mut self, n: i8) -> Result<()> {
        self.write_u8(n as u8)
    }

    pub fn write_f32(&mut self, x: f32) -> Result<()> {
        self.write_u32(x.to_bits())
    }

    pub fn write_f64(&mut self, x: f64) -> Result<()> {
        self.write_u64(x.to_bits())
    }

    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_u64(s.len() as u64)?;
        if !s.is_empty() {
            self.write_bytes(s.as_bytes())?;
        }
        Ok(())
    }

    pub fn write_date(&mut self, date: crate::date::Date) -> Result<()> {
        self.write_u16(date.year)?;
        self.write_u16(date.day)
    }

    /// Backpatch the header checksum and close the file. Unregisters the
    /// entry, so a subsequent `burn` no longer touches it.
    pub fn close(self) -> Result<()> {
        let checksum = self.checksum.clone().finalize();
        self.registry.with_file(self.id, |file| {
            file.seek(SeekFrom::Start(CHECKSUM_OFFSET))?;
            file.write_all(&checksum.to_be_bytes())?;
            Ok(())
        })?;
        // drop the File by taking it out of the registry
        self.registry.unregister(self.id);
        Ok(())
    }
}

/// A dump file open for reading, seeked past the header.
pub struct DumpReader {
    file: File,
}

impl DumpReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(BODY_OFFSET))?;
        Ok(Self { file })
    }

    pub fn seek_start(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(BODY_OFFSET))?;
        Ok(())
    }

    /// Reads the header and returns `(version, dump_type_tag, checksum,
    /// expiration)` without consuming the body. Verification of version
    /// and checksum is optional in the core; callers may check either.
    pub fn read_header(path: impl AsRef<Path>) -> Result<(u8, u8, u32, u64)> {
        let mut file = File::open(path)?;
        let mut buf = [0u8; 46];
        file.read_exact(&mut buf)?;
        let version = buf[0];
        let tag = buf[1];
        let checksum = u32::from_be_bytes(buf[2..6].try_into().unwrap());
        let expiration = u64::from_be_bytes(buf[6..14].try_into().unwrap());
        Ok((version, tag, checksum, expiration))
    }

    /// Recomputes the CRC-32 of the body and compares it to the
    /// header-claimed checksum, for consumer-side integrity checks.
    pub fn verify_checksum(path: impl AsRef<Path>) -> Result<bool> {
        let (_, _, claimed, _) = Self::read_header(&path)?;
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(BODY_OFFSET))?;
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize() == claimed)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact(buf).map_err(HoarderError::Io)
    }

    /// Reads `buf.len()` bytes, distinguishing a clean end-of-stream
    /// (zero bytes available, returns `Ok(false)`) from corruption (a
    /// partial read mid-record, returns `Err`). Used by streaming readers
    /// that don't know the record count ahead of time.
    fn read_bytes_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut total = 0;
        loop {
            if total == buf.len() {
                return Ok(true);
            }
            let n = self.file.read(&mut buf[total..])?;
            if n == 0 {
                if total == 0 {
                    return Ok(false);
                }
                return Err(HoarderError::Parse(
                    "unexpected end of file mid-record".into(),
                ));
            }
            total += n;
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_bytes(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    /// Reads a `u16` that may legitimately sit at a record boundary;
    /// returns `Ok(None)` on clean EOF.
    pub fn read_u16_or_eof(&mut self) -> Result<Option<u16>> {
        let mut buf = [0u8; 2];
        if self.read_bytes_or_eof(&mut buf)? {
            Ok(Some(u16::from_be_bytes(buf)))
        } else {
            Ok(None)
        }
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u64()? as usize;
        let mut buf = vec![0u8; len];
        self.read_bytes(&mut buf)?;
        String::from_utf8(buf).map_err(|e| HoarderError::Parse(e.to_string()))
    }

    pub fn read_date(&mut self) -> Result<crate::date::Date> {
        let year = self.read_u16()?;
        let day = self.read_u16()?;
        Ok(crate::date::Date { year, day })
    }

    /// Reads a `Date` that may legitimately sit at a record boundary;
    /// returns `Ok(None)` on clean EOF, errors on a partial record.
    pub fn read_date_or_eof(&mut self) -> Result<Option<crate::date::Date>> {
        match self.read_u16_or_eof()? {
            None => Ok(None),
            Some(year) => {
                let day = self.read_u16()?;
                Ok(Some(crate::date::Date { year, day }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_header_and_body() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.dump");
        let registry = DumpRegistry::new();
        let mut writer = DumpWriter::open(&registry, &path, DumpType::Orders, 12345).unwrap();
        writer.write_u64(7).unwrap();
        writer.write_string("hello").unwrap();
        writer.write_f64(3.25).unwrap();
        writer.close().unwrap();

        let (version, tag, _checksum, expiration) = DumpReader::read_header(&path).unwrap();
        assert_eq!(version, DUMP_VERSION);
        assert_eq!(tag, DumpType::Orders.tag());
        assert_eq!(expiration, 12345);

        let mut reader = DumpReader::open(&path).unwrap();
        assert_eq!(reader.read_u64().unwrap(), 7);
        assert_eq!(reader.read_string().unwrap(), "hello");
        assert_eq!(reader.read_f64().unwrap(), 3.25);

        assert!(DumpReader::verify_checksum(&path).unwrap());
    }

    #[test]
    fn flipping_a_body_byte_breaks_the_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.dump");
        let registry = DumpRegistry::new();
        let mut writer = DumpWriter::open(&registry, &path, DumpType::Orders, 0).unwrap();
        writer.write_u64(0xdead_beef).unwrap();
        writer.close().unwrap();

        assert!(DumpReader::verify_checksum(&path).unwrap());

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(!DumpReader::verify_checksum(&path).unwrap());
    }

    #[test]
    fn burn_removes_unfinished_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("unfinished.dump");
        let registry = DumpRegistry::new();
        let writer = DumpWriter::open(&registry, &path, DumpType::Internal, 0).unwrap();
        assert_eq!(registry.open_count(), 1);
        assert!(path.exists());

        std::mem::forget(writer); // simulate a panic between open and close
        registry.burn();

        assert_eq!(registry.open_count(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn empty_orders_sweep_encodes_zero_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orders-0.dump");
        let registry = DumpRegistry::new();
        let mut writer = DumpWriter::open(&registry, &path, DumpType::Orders, 300).unwrap();
        writer.write_u64(0).unwrap();
        writer.close().unwrap();

        let mut reader = DumpReader::open(&path).unwrap();
        assert_eq!(reader.read_u64().unwrap(), 0);
    }

    #[test]
    fn streaming_reader_treats_short_read_at_boundary_as_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.dump");
        let registry = DumpRegistry::new();
        let mut writer = DumpWriter::open(&registry, &path, DumpType::Histories, 0).unwrap();
        writer
            .write_date(crate::date::Date { year: 2026, day: 10 })
            .unwrap();
        writer.close().unwrap();

        let mut reader = DumpReader::open(&path).unwrap();
        assert_eq!(
            reader.read_date_or_eof().unwrap(),
            Some(crate::date::Date { year: 2026, day: 10 })
        );
        assert_eq!(reader.read_date_or_eof().unwrap(), None);
    }
}
