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

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{bail, Context, Result};
use tempfile::NamedTempFile;
use tracing::debug;

/// Produces tar archives from directory trees.
pub trait Archiver {
    /// Archive `entries`, named relative to `base_dir`, into `output`.
    ///
    /// `output` only appears once the archive is complete and closed.
    fn archive(&self, output: &Path, base_dir: &Path, entries: &[&str]) -> Result<()>;
}

/// In-process tar writer.
///
/// Entries are walked in sorted order and owned by root with fixed modes,
/// so the bytes depend only on file contents and `mtime`.
#[derive(Debug, Default, Clone)]
pub struct TarArchiver {
    mtime: Option<u64>,
}

impl TarArchiver {
    /// Pin every entry's mtime; otherwise the filesystem mtime is used.
    pub fn new(mtime: Option<u64>) -> Self {
        TarArchiver { mtime }
    }

    fn append_tree<W: Write>(
        &self,
        output: &mut tar::Builder<W>,
        base_dir: &Path,
        entry: &Path,
    ) -> Result<()> {
        let mut stack: Vec<PathBuf> = vec![entry.to_path_buf()];

        while let Some(rel) = stack.pop() {
            let path = base_dir.join(&rel);
            let meta = fs::symlink_metadata(&path)
                .with_context(|| format!("Failed to stat {:?}", path))?;
            let name = tar_name(&rel);

            let mut header = tar::Header::new_gnu();
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(self.mtime.unwrap_or_else(|| {
                meta.modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0)
            }));

            if meta.is_dir() {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                output.append_data(&mut header, format!("{}/", name), io::empty())?;

                let mut children = fs::read_dir(&path)?
                    .map(|e| e.map(|e| e.file_name()))
                    .collect::<io::Result<Vec<_>>>()?;
                children.sort();
                children.reverse();
                for child in children {
                    stack.push(rel.join(child));
                }
            } else if meta.is_file() {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(meta.len());
                let f = fs::File::open(&path)?;
                output.append_data(&mut header, &name, f)?;
            } else {
                bail!("Unsupported file type at {:?}", path);
            }
            debug!(entry = %name, "Archived");
        }

        Ok(())
    }
}

impl Archiver for TarArchiver {
    fn archive(&self, output: &Path, base_dir: &Path, entries: &[&str]) -> Result<()> {
        let parent = output
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Archive path {:?} has no parent", output))?;
        fs::create_dir_all(parent)?;

        let tmp = NamedTempFile::new_in(parent)?;
        {
            let mut builder = tar::Builder::new(BufWriter::new(tmp.reopen()?));
            builder.follow_symlinks(false);
            for entry in entries {
                self.append_tree(&mut builder, base_dir, Path::new(entry))
                    .with_context(|| format!("Archiving {:?} from {:?}", entry, base_dir))?;
            }
            let buf_writer = builder.into_inner()?;
            let file = buf_writer
                .into_inner()
                .map_err(|e| anyhow::anyhow!("bufwriter: {}", e))?;
            file.sync_all()?;
        }
        tmp.persist(output)
            .map_err(|e| anyhow::anyhow!("persist archive {:?}: {}", output, e))?;

        Ok(())
    }
}

/// Forward-slash entry name, whatever the host separator.
fn tar_name(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
