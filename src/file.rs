//! # File — Checkpoint Container Format
//!
//! Every durable record lives in a little-endian binary container:
//!
//! ```text
//! magic (4) | appid (1) | version (1) | type (1) | reserved (1)
//! fingerprint (4) | body … | MD5 digest (16, when hashing is on)
//! ```
//!
//! A file whose magic, appid, fingerprint, or digest does not match is
//! treated as absent — the computation restarts from its last good record
//! instead of consuming corrupt state. Writes are atomic (temp file +
//! rename), the same discipline the platform uses for all resumable state.
//!
//! The LLR2 compatibility mode emits version 2 containers: no MD5, a 32-bit
//! additive checksum over the body, and 20 reserved zero bytes at the end.
//!
//! Child files (proof points, per-base retries) derive their path and
//! fingerprint from the parent via [`File::add_child`] /
//! [`unique_fingerprint`], so a record produced under a different base `a`,
//! point index, or Lucas `P` can never be mistaken for the current one.

use std::fs;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use rug::Integer;

use crate::gw::SerializedGwNum;
use crate::state::TaskState;

pub const MAGIC_NUM: u32 = 0x9f2b_3cd4;
pub const FILE_APPID: u8 = 4;
const VERSION: u8 = 1;
const VERSION_LLR2: u8 = 2;
const HEADER_LEN: usize = 12;

/// Value-typed handle to one checkpoint file. Cloning the handle does not
/// clone the data; ownership of the bytes stays on disk.
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
    fingerprint: u32,
    pub hash: bool,
    pub llr2: bool,
}

/// Mix a per-run distinguisher (base, point index, prime P) into a parent
/// fingerprint.
pub fn unique_fingerprint(fingerprint: u32, distinguisher: &str) -> u32 {
    let mut hasher = Md5::new();
    hasher.update(fingerprint.to_le_bytes());
    hasher.update(distinguisher.as_bytes());
    let digest = hasher.finalize();
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

impl File {
    pub fn new(path: impl Into<PathBuf>, fingerprint: u32) -> File {
        File {
            path: path.into(),
            fingerprint,
            hash: true,
            llr2: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(&self) -> u32 {
        self.fingerprint
    }

    /// Derive a child file `<path>.<name>` with a mixed fingerprint.
    pub fn add_child(&self, name: &str) -> File {
        let mut path = self.path.as_os_str().to_os_string();
        path.push(".");
        path.push(name);
        File {
            path: PathBuf::from(path),
            fingerprint: unique_fingerprint(self.fingerprint, name),
            hash: self.hash,
            llr2: self.llr2,
        }
    }

    /// Read and validate the container, returning the decoded record, or
    /// `None` when the file is missing, foreign, or corrupt.
    pub fn read_state(&self) -> Option<TaskState> {
        let data = fs::read(&self.path).ok()?;
        if data.len() < HEADER_LEN {
            return None;
        }
        if u32::from_le_bytes(data[0..4].try_into().unwrap()) != MAGIC_NUM {
            tracing::warn!(file = %self.path.display(), "magic mismatch, ignoring file");
            return None;
        }
        if data[4] != FILE_APPID {
            return None;
        }
        let version = data[5];
        let record_type = data[6];
        if u32::from_le_bytes(data[8..12].try_into().unwrap()) != self.fingerprint {
            tracing::warn!(file = %self.path.display(), "fingerprint mismatch, ignoring file");
            return None;
        }

        let body = match version {
            VERSION => {
                if self.hash {
                    if data.len() < HEADER_LEN + 16 {
                        return None;
                    }
                    let (payload, digest) = data.split_at(data.len() - 16);
                    if Md5::digest(payload).as_slice() != digest {
                        tracing::warn!(file = %self.path.display(), "hash mismatch, ignoring file");
                        return None;
                    }
                    &payload[HEADER_LEN..]
                } else {
                    &data[HEADER_LEN..]
                }
            }
            VERSION_LLR2 => {
                if data.len() < HEADER_LEN + 24 {
                    return None;
                }
                let body_end = data.len() - 24;
                let body = &data[HEADER_LEN..body_end];
                let sum = u32::from_le_bytes(data[body_end..body_end + 4].try_into().unwrap());
                if additive_checksum(body) != sum {
                    return None;
                }
                body
            }
            _ => return None,
        };

        TaskState::read(record_type, &mut Reader::new(body))
    }

    /// Serialize and atomically persist a record.
    pub fn write_state(&self, state: &TaskState) -> std::io::Result<()> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC_NUM.to_le_bytes());
        out.push(FILE_APPID);
        out.push(if self.llr2 { VERSION_LLR2 } else { VERSION });
        out.push(state.type_byte());
        out.push(0);
        out.extend_from_slice(&self.fingerprint.to_le_bytes());

        let mut writer = Writer::new();
        state.write(&mut writer);
        let body = writer.into_bytes();
        out.extend_from_slice(&body);

        if self.llr2 {
            out.extend_from_slice(&additive_checksum(&body).to_le_bytes());
            out.extend_from_slice(&[0u8; 20]);
        } else if self.hash {
            let digest = Md5::digest(&out);
            out.extend_from_slice(&digest);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.tmp_path();
        fs::write(&tmp, &out)?;
        fs::rename(&tmp, &self.path)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut p = self.path.as_os_str().to_os_string();
        p.push(".tmp");
        PathBuf::from(p)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Remove the file; declared on successful termination of a driver.
    pub fn clear(&self) {
        let _ = fs::remove_file(&self.path);
        let _ = fs::remove_file(self.tmp_path());
    }
}

fn additive_checksum(body: &[u8]) -> u32 {
    body.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

/// Little-endian record encoder.
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Writer {
        Writer { buf: Vec::new() }
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u32(v as u32);
    }

    /// Length-prefixed magnitude, least significant byte first. Only
    /// non-negative residues are persisted.
    pub fn write_giant(&mut self, v: &Integer) {
        debug_assert!(*v >= 0);
        let bytes = v.to_digits::<u8>(rug::integer::Order::Lsf);
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(&bytes);
    }

    pub fn write_serialized(&mut self, v: &SerializedGwNum) {
        self.write_u32(v.as_bytes().len() as u32);
        self.buf.extend_from_slice(v.as_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for Writer {
    fn default() -> Self {
        Writer::new()
    }
}

/// Little-endian record decoder; every read returns `None` past the end so
/// a truncated record decodes as absent.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(slice)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        Some(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_bool(&mut self) -> Option<bool> {
        Some(self.read_u32()? != 0)
    }

    pub fn read_giant(&mut self) -> Option<Integer> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        Some(Integer::from_digits(bytes, rug::integer::Order::Lsf))
    }

    pub fn read_serialized(&mut self) -> Option<SerializedGwNum> {
        let len = self.read_u32()? as usize;
        Some(SerializedGwNum::from_bytes(self.take(len)?.to_vec()))
    }
}
