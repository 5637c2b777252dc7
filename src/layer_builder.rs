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
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::archive::Archiver;
use crate::config::GlobalConfig;
use crate::error::BuildError;
use crate::hive::{create_hive, HiveCreator, HIVE_NAMES};
use crate::metadata::LAYER_TAR;

/// Top-level directory of a Windows layer's filesystem contents.
pub const LAYER_ROOT: &str = "Files";
/// Where the hives live, below `LAYER_ROOT`.
pub const HIVE_DIR: &str = "Windows/System32/config";

/// Remove everything a previous build left in `output`.
pub fn purge_output(output: &Path) -> Result<()> {
    if output.exists() {
        info!(path = %output.display(), "Purging previous build output");
        fs::remove_dir_all(output).with_context(|| format!("Purging {:?}", output))?;
    }
    fs::create_dir_all(output).with_context(|| format!("Creating {:?}", output))?;
    Ok(())
}

/// Lay out `Files/` with the hives and licenses under the staging dir.
pub fn stage_tree(global_conf: &GlobalConfig, hives: &mut dyn HiveCreator) -> Result<PathBuf> {
    let staging = global_conf.staging_dir();
    let layer_root = staging.join(LAYER_ROOT);
    let hive_dir = layer_root.join(HIVE_DIR);
    fs::create_dir_all(&hive_dir).with_context(|| format!("Creating {:?}", hive_dir))?;

    for name in HIVE_NAMES {
        let path = hive_dir.join(name);
        create_hive(hives, name, &path).with_context(|| format!("Creating hive {}", name))?;
        info!(hive = name, "Hive ready");
    }

    for license in &global_conf.licenses {
        let file_name = license
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("License path {:?} has no file name", license))?;
        let dest = layer_root.join(file_name);
        fs::copy(license, &dest)
            .with_context(|| format!("Copying license {:?} to {:?}", license, dest))?;
        debug!(license = %license.display(), "License staged");
    }

    Ok(staging)
}

/// Stage the layer contents and archive them into `layer.tar`.
pub fn assemble_layer(
    global_conf: &GlobalConfig,
    hives: &mut dyn HiveCreator,
    archiver: &dyn Archiver,
) -> Result<PathBuf> {
    let staging = stage_tree(global_conf, hives)?;

    let layer_root = staging.join(LAYER_ROOT);
    if fs::read_dir(&layer_root)?.next().is_none() {
        return Err(BuildError::validation(&layer_root, "staging tree is empty").into());
    }

    let layer_tar = global_conf.output.join(LAYER_TAR);
    archiver.archive(&layer_tar, &staging, &[LAYER_ROOT])?;

    match fs::metadata(&layer_tar) {
        Ok(meta) if meta.len() > 0 => {}
        _ => return Err(BuildError::validation(&layer_tar, "layer archive missing or empty").into()),
    }

    info!(path = %layer_tar.display(), "Layer archived");
    Ok(layer_tar)
}
