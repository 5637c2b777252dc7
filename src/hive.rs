// Copyright (c) 2019, 2020 Codethink Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::error::BuildError;

/// Hive files every Windows system volume is expected to carry.
pub const HIVE_NAMES: [&str; 5] = ["DEFAULT", "SAM", "SECURITY", "SOFTWARE", "SYSTEM"];

const KEY_PREFIX: &str = "hpc-base-image";

const BASE_BLOCK_SIZE: usize = 0x1000;
const HBIN_SIZE: usize = 0x1000;
const HBIN_HEADER_SIZE: usize = 0x20;
const CHECKSUM_OFFSET: usize = 0x1FC;

const KEY_HIVE_ENTRY: u16 = 0x0004;
const KEY_NO_DELETE: u16 = 0x0008;
const KEY_COMP_NAME: u16 = 0x0020;
const NO_CELL: u32 = 0xFFFF_FFFF;

/// Self-relative security descriptor: owner BUILTIN\Administrators,
/// group SYSTEM, NULL DACL.
const ROOT_SECURITY_DESCRIPTOR: [u8; 48] = [
    0x01, 0x00, 0x04, 0x80, // revision, sbz1, SE_SELF_RELATIVE | SE_DACL_PRESENT
    0x14, 0x00, 0x00, 0x00, // owner
    0x24, 0x00, 0x00, 0x00, // group
    0x00, 0x00, 0x00, 0x00, // sacl
    0x00, 0x00, 0x00, 0x00, // dacl
    0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x20, 0x00, 0x00, 0x00, 0x20, 0x02, 0x00, 0x00,
    0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x12, 0x00, 0x00, 0x00,
];

/// Something able to materialize an empty registry hive at a path.
///
/// A hive is created by loading it under a transient key and immediately
/// unloading that key again; the file left behind is the empty hive.
pub trait HiveCreator {
    /// Checked once before the build touches the filesystem.
    fn check_preconditions(&self) -> Result<(), BuildError> {
        Ok(())
    }

    fn load(&mut self, key: &str, path: &Path) -> Result<(), BuildError>;

    fn unload(&mut self, key: &str) -> Result<(), BuildError>;
}

/// Unique per call so a stale or concurrent key can never be reused.
pub fn transient_key_name(hive: &str) -> String {
    format!("{}-{}-{}", KEY_PREFIX, hive, uuid::Uuid::new_v4())
}

/// Create the hive `name` at `path`, replacing whatever is there.
pub fn create_hive(creator: &mut dyn HiveCreator, name: &str, path: &Path) -> Result<()> {
    if path.exists() {
        debug!(path = %path.display(), "Removing stale hive");
        fs::remove_file(path).with_context(|| format!("Removing stale hive {:?}", path))?;
    }

    let key = transient_key_name(name);
    debug!(hive = name, key = %key, "Loading hive");
    creator.load(&key, path)?;

    // The key must be released before anything else can fail.
    let unloaded = creator.unload(&key);
    if let Err(ref e) = unloaded {
        warn!(hive = name, key = %key, error = %e, "Unloading hive failed");
    }

    validate_hive(path)?;
    unloaded?;

    debug!(hive = name, path = %path.display(), "Hive created");
    Ok(())
}

/// Reject anything that is not a structurally sound `regf` file.
pub fn validate_hive(path: &Path) -> Result<(), BuildError> {
    let meta = fs::metadata(path)
        .map_err(|_| BuildError::validation(path, "hive file does not exist"))?;
    if meta.len() == 0 {
        return Err(BuildError::validation(path, "hive file is empty"));
    }
    if meta.len() < (BASE_BLOCK_SIZE + HBIN_HEADER_SIZE) as u64 {
        return Err(BuildError::validation(
            path,
            format!("hive file is truncated ({} bytes)", meta.len()),
        ));
    }

    let mut head = vec![0u8; BASE_BLOCK_SIZE + 4];
    fs::File::open(path)?.read_exact(&mut head)?;

    if &head[0..4] != b"regf" {
        return Err(BuildError::validation(path, "missing regf signature"));
    }
    let stored = read_u32(&head, CHECKSUM_OFFSET);
    let computed = base_block_checksum(&head[..BASE_BLOCK_SIZE]);
    if stored != computed {
        return Err(BuildError::validation(
            path,
            format!("base block checksum {:#010x} != {:#010x}", stored, computed),
        ));
    }
    if &head[BASE_BLOCK_SIZE..BASE_BLOCK_SIZE + 4] != b"hbin" {
        return Err(BuildError::validation(path, "missing first hbin"));
    }

    Ok(())
}

/// Creates hives through `reg.exe`. Needs an elevated Windows session.
#[derive(Debug, Clone)]
pub struct RegHiveCreator {
    program: PathBuf,
}

impl Default for RegHiveCreator {
    fn default() -> Self {
        RegHiveCreator {
            program: PathBuf::from("reg.exe"),
        }
    }
}

impl RegHiveCreator {
    fn run(&self, args: &[&OsStr]) -> Result<i32, BuildError> {
        let status = Command::new(&self.program)
            .args(args)
            .stdout(Stdio::null())
            .status()?;
        Ok(status.code().unwrap_or(-1))
    }
}

impl HiveCreator for RegHiveCreator {
    fn check_preconditions(&self) -> Result<(), BuildError> {
        let elevated = Command::new("net")
            .arg("session")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if elevated {
            Ok(())
        } else {
            Err(BuildError::Precondition {
                message: "Creating registry hives requires Administrator privileges".to_string(),
                remediation: "re-run from an elevated prompt, or pass --hive-backend builtin"
                    .to_string(),
            })
        }
    }

    fn load(&mut self, key: &str, path: &Path) -> Result<(), BuildError> {
        let target = format!("HKLM\\{}", key);
        let status = self.run(&[OsStr::new("load"), OsStr::new(&target), path.as_os_str()])?;
        if status != 0 {
            return Err(BuildError::HiveLoad {
                key: key.to_string(),
                path: path.to_path_buf(),
                status,
            });
        }
        Ok(())
    }

    fn unload(&mut self, key: &str) -> Result<(), BuildError> {
        let target = format!("HKLM\\{}", key);
        let status = self.run(&[OsStr::new("unload"), OsStr::new(&target)])?;
        if status != 0 {
            return Err(BuildError::HiveUnload {
                key: key.to_string(),
                status,
            });
        }
        Ok(())
    }
}

/// Writes minimal hives in process, so images can be built off Windows.
///
/// Like the registry itself, the file is flushed to disk on unload.
#[derive(Debug, Default)]
pub struct BuiltinHiveCreator {
    timestamp: u64,
    loaded: HashMap<String, PathBuf>,
}

impl BuiltinHiveCreator {
    /// `timestamp` is a Windows FILETIME stamped into every header.
    pub fn new(timestamp: u64) -> Self {
        BuiltinHiveCreator {
            timestamp,
            loaded: HashMap::new(),
        }
    }
}

impl HiveCreator for BuiltinHiveCreator {
    fn load(&mut self, key: &str, path: &Path) -> Result<(), BuildError> {
        if self.loaded.contains_key(key) {
            return Err(BuildError::HiveLoad {
                key: key.to_string(),
                path: path.to_path_buf(),
                status: 1,
            });
        }
        self.loaded.insert(key.to_string(), path.to_path_buf());
        Ok(())
    }

    fn unload(&mut self, key: &str) -> Result<(), BuildError> {
        let path = self.loaded.remove(key).ok_or_else(|| BuildError::HiveUnload {
            key: key.to_string(),
            status: 1,
        })?;
        let root_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| !n.is_empty() && n.is_ascii() && n.len() <= 255)
            .unwrap_or_else(|| "ROOT".to_string());
        fs::write(&path, empty_hive(&root_name, self.timestamp))?;
        Ok(())
    }
}

/// One base block and one hbin holding the root key, its security cell
/// and a single free cell.
pub fn empty_hive(root_name: &str, timestamp: u64) -> Vec<u8> {
    let mut buf = vec![0u8; BASE_BLOCK_SIZE + HBIN_SIZE];
    let name = root_name.as_bytes();

    let nk_offset = HBIN_HEADER_SIZE;
    let nk_size = align8(4 + 76 + name.len());
    let sk_offset = nk_offset + nk_size;
    let sk_size = align8(4 + 20 + ROOT_SECURITY_DESCRIPTOR.len());
    let free_offset = sk_offset + sk_size;

    // Base block
    buf[0..4].copy_from_slice(b"regf");
    put_u32(&mut buf, 0x04, 1);
    put_u32(&mut buf, 0x08, 1);
    put_u64(&mut buf, 0x0C, timestamp);
    put_u32(&mut buf, 0x14, 1);
    put_u32(&mut buf, 0x18, 5);
    put_u32(&mut buf, 0x1C, 0);
    put_u32(&mut buf, 0x20, 1);
    put_u32(&mut buf, 0x24, nk_offset as u32);
    put_u32(&mut buf, 0x28, HBIN_SIZE as u32);
    put_u32(&mut buf, 0x2C, 1);
    for (i, unit) in root_name.encode_utf16().take(31).enumerate() {
        put_u16(&mut buf, 0x30 + i * 2, unit);
    }
    let checksum = base_block_checksum(&buf[..BASE_BLOCK_SIZE]);
    put_u32(&mut buf, CHECKSUM_OFFSET, checksum);

    let bins = &mut buf[BASE_BLOCK_SIZE..];

    // hbin header
    bins[0..4].copy_from_slice(b"hbin");
    put_u32(bins, 0x04, 0);
    put_u32(bins, 0x08, HBIN_SIZE as u32);
    put_u64(bins, 0x14, timestamp);

    // Root key (nk), allocated cells carry a negative size
    put_i32(bins, nk_offset, -(nk_size as i32));
    let nk = nk_offset + 4;
    bins[nk..nk + 2].copy_from_slice(b"nk");
    put_u16(bins, nk + 2, KEY_HIVE_ENTRY | KEY_NO_DELETE | KEY_COMP_NAME);
    put_u64(bins, nk + 4, timestamp);
    put_u32(bins, nk + 28, NO_CELL);
    put_u32(bins, nk + 32, NO_CELL);
    put_u32(bins, nk + 40, NO_CELL);
    put_u32(bins, nk + 44, sk_offset as u32);
    put_u32(bins, nk + 48, NO_CELL);
    put_u16(bins, nk + 72, name.len() as u16);
    bins[nk + 76..nk + 76 + name.len()].copy_from_slice(name);

    // Security (sk), a ring of one
    put_i32(bins, sk_offset, -(sk_size as i32));
    let sk = sk_offset + 4;
    bins[sk..sk + 2].copy_from_slice(b"sk");
    put_u32(bins, sk + 4, sk_offset as u32);
    put_u32(bins, sk + 8, sk_offset as u32);
    put_u32(bins, sk + 12, 1);
    put_u32(bins, sk + 16, ROOT_SECURITY_DESCRIPTOR.len() as u32);
    bins[sk + 20..sk + 20 + ROOT_SECURITY_DESCRIPTOR.len()]
        .copy_from_slice(&ROOT_SECURITY_DESCRIPTOR);

    // Remainder is one free cell
    put_i32(bins, free_offset, (HBIN_SIZE - free_offset) as i32);

    buf
}

/// XOR of the first 127 dwords, avoiding the two reserved values.
fn base_block_checksum(block: &[u8]) -> u32 {
    let sum = (0..CHECKSUM_OFFSET)
        .step_by(4)
        .fold(0u32, |acc, off| acc ^ read_u32(block, off));
    match sum {
        0xFFFF_FFFF => 0xFFFF_FFFE,
        0 => 1,
        v => v,
    }
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_i32(buf: &mut [u8], off: usize, v: i32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}
