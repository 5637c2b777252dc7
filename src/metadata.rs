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

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::digest::DigestComputer;

pub const LAYER_VERSION: &str = "1.0";
pub const LAYER_TAR: &str = "layer.tar";
pub const LAYER_JSON: &str = "json";
pub const LAYER_VERSION_FILE: &str = "VERSION";
pub const CONFIG_JSON: &str = "config.json";
pub const MANIFEST_JSON: &str = "manifest.json";

/// Docker's container configuration block. Unset collections serialize
/// as `null`, never as absent or empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    pub hostname: String,
    pub domainname: String,
    pub user: String,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
    pub open_stdin: bool,
    pub stdin_once: bool,
    pub env: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub image: String,
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,
    pub working_dir: String,
    pub entrypoint: Option<Vec<String>>,
    pub on_build: Option<Vec<String>>,
    pub labels: Option<BTreeMap<String, String>>,
}

impl ContainerConfig {
    /// Defaults inherited by containers started from the image.
    pub fn runtime(user: &str, cmd: &[String]) -> Self {
        ContainerConfig {
            user: user.to_string(),
            cmd: Some(cmd.to_vec()),
            ..Default::default()
        }
    }
}

/// The per-layer `json` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerJson {
    pub id: String,
    pub created: String,
    pub container_config: ContainerConfig,
    pub config: ContainerConfig,
    pub architecture: String,
    pub os: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub created: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<String>,
}

/// The image configuration, stored as `<configHash>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub architecture: String,
    pub config: ContainerConfig,
    pub created: String,
    pub history: Vec<History>,
    pub os: String,
    pub rootfs: RootFs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestEntry {
    pub config: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repo_tags: Vec<String>,
    pub layers: Vec<String>,
}

/// Everything the documents of one build share.
#[derive(Debug, Clone)]
pub struct ImageMetadata {
    pub created: String,
    pub architecture: String,
    pub os: String,
    pub runtime: ContainerConfig,
    pub tags: Vec<String>,
}

impl ImageMetadata {
    pub fn layer_json(&self, layer_hash: &str) -> LayerJson {
        LayerJson {
            id: layer_hash.to_string(),
            created: self.created.clone(),
            container_config: ContainerConfig::default(),
            config: self.runtime.clone(),
            architecture: self.architecture.clone(),
            os: self.os.clone(),
        }
    }

    pub fn image_config(&self, layer_hash: &str) -> ImageConfig {
        ImageConfig {
            architecture: self.architecture.clone(),
            config: self.runtime.clone(),
            created: self.created.clone(),
            history: vec![History {
                created: self.created.clone(),
            }],
            os: self.os.clone(),
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: vec![format!("sha256:{}", layer_hash)],
            },
        }
    }

    pub fn manifest(&self, config_hash: &str, layer_hash: &str) -> Vec<ManifestEntry> {
        vec![ManifestEntry {
            config: format!("{}.json", config_hash),
            repo_tags: self.tags.clone(),
            layers: vec![format!("{}/{}", layer_hash, LAYER_TAR)],
        }]
    }
}

/// Write `VERSION` and `json` into an existing layer directory.
pub fn emit_layer_metadata(layer_dir: &Path, meta: &ImageMetadata, layer_hash: &str) -> Result<()> {
    fs::write(layer_dir.join(LAYER_VERSION_FILE), LAYER_VERSION)?;
    write_json(&layer_dir.join(LAYER_JSON), &meta.layer_json(layer_hash))?;
    Ok(())
}

/// Write the image config, then rename it to its own digest.
///
/// Returns the config hash.
pub fn emit_image_config(
    image_dir: &Path,
    meta: &ImageMetadata,
    layer_hash: &str,
    digester: &dyn DigestComputer,
) -> Result<String> {
    let staged = image_dir.join(CONFIG_JSON);
    write_json(&staged, &meta.image_config(layer_hash))?;

    let config_hash = digester.digest_file(&staged)?;
    let dest = image_dir.join(format!("{}.json", config_hash));
    fs::rename(&staged, &dest).with_context(|| format!("Renaming {:?} to {:?}", staged, dest))?;

    info!(config = %config_hash, "Image config written");
    Ok(config_hash)
}

pub fn emit_manifest(
    image_dir: &Path,
    meta: &ImageMetadata,
    config_hash: &str,
    layer_hash: &str,
) -> Result<()> {
    write_json(
        &image_dir.join(MANIFEST_JSON),
        &meta.manifest(config_hash, layer_hash),
    )
}

/// Serialize compactly and close the file before returning.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = fs::File::create(path).with_context(|| format!("Creating {:?}", path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("bufwriter: {}", e))?
        .sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Sha256Digester;

    const LAYER: &str = "4f1c0a4b2d7e9e33a0f8a51e7bd3c2bf0e1b1f5c7a6e4d3c2b1a09f8e7d6c5b4";

    fn metadata(tags: Vec<String>) -> ImageMetadata {
        ImageMetadata {
            created: "2024-01-01T00:00:00Z".to_string(),
            architecture: "amd64".to_string(),
            os: "windows".to_string(),
            runtime: ContainerConfig::runtime("ContainerUser", &["cmd.exe".to_string()]),
            tags,
        }
    }

    #[test]
    fn layer_json_matches_golden() {
        let doc = metadata(vec![]).layer_json(LAYER);
        let actual = serde_json::to_string_pretty(&doc).unwrap();
        let expected = include_str!("../testdata/layer.json");
        assert_eq!(actual, expected.trim_end());
    }

    #[test]
    fn golden_ignores_only_created() {
        let mut meta = metadata(vec![]);
        meta.created = "2031-05-06T07:08:09.123Z".to_string();
        let mut actual = serde_json::to_value(meta.layer_json(LAYER)).unwrap();
        let mut expected: serde_json::Value =
            serde_json::from_str(include_str!("../testdata/layer.json")).unwrap();
        actual["created"] = serde_json::Value::Null;
        expected["created"] = serde_json::Value::Null;
        assert_eq!(actual, expected);
    }

    #[test]
    fn manifest_matches_golden() {
        let doc = metadata(vec![]).manifest("c0ffee", LAYER);
        let actual = serde_json::to_string_pretty(&doc).unwrap();
        let expected = include_str!("../testdata/manifest.json");
        assert_eq!(actual, expected.trim_end());
    }

    #[test]
    fn repo_tags_only_when_configured() {
        let plain = serde_json::to_value(metadata(vec![]).manifest("c", "l")).unwrap();
        assert!(plain[0].get("RepoTags").is_none());

        let tagged = serde_json::to_value(
            metadata(vec!["hpc:latest".to_string()]).manifest("c", "l"),
        )
        .unwrap();
        assert_eq!(tagged[0]["RepoTags"], serde_json::json!(["hpc:latest"]));
    }

    #[test]
    fn unset_fields_are_null_not_absent() {
        let value = serde_json::to_value(ContainerConfig::default()).unwrap();
        for key in ["Env", "Cmd", "Volumes", "Entrypoint", "OnBuild", "Labels"] {
            assert_eq!(value.get(key), Some(&serde_json::Value::Null), "{}", key);
        }
        assert_eq!(value["WorkingDir"], "");
    }

    #[test]
    fn image_config_shares_created_and_references_layer() {
        let config = metadata(vec![]).image_config(LAYER);
        assert_eq!(config.history, vec![History { created: config.created.clone() }]);
        assert_eq!(config.rootfs.diff_ids, vec![format!("sha256:{}", LAYER)]);

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["rootfs"]["type"], "layers");
        assert_eq!(value["config"]["User"], "ContainerUser");
        assert_eq!(value["config"]["Cmd"], serde_json::json!(["cmd.exe"]));
    }

    #[test]
    fn config_file_is_named_by_its_digest() {
        let dir = tempfile::tempdir().unwrap();
        let hash =
            emit_image_config(dir.path(), &metadata(vec![]), LAYER, &Sha256Digester).unwrap();

        let renamed = dir.path().join(format!("{}.json", hash));
        assert!(!dir.path().join(CONFIG_JSON).exists());
        assert_eq!(Sha256Digester.digest_file(&renamed).unwrap(), hash);

        let parsed: ImageConfig =
            serde_json::from_slice(&fs::read(&renamed).unwrap()).unwrap();
        assert_eq!(parsed, metadata(vec![]).image_config(LAYER));
    }

    #[test]
    fn layer_directory_contents() {
        let dir = tempfile::tempdir().unwrap();
        emit_layer_metadata(dir.path(), &metadata(vec![]), LAYER).unwrap();
        assert_eq!(fs::read(dir.path().join(LAYER_VERSION_FILE)).unwrap(), b"1.0");
        let parsed: LayerJson =
            serde_json::from_slice(&fs::read(dir.path().join(LAYER_JSON)).unwrap()).unwrap();
        assert_eq!(parsed.id, LAYER);
    }
}
