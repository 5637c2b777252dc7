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
use tracing::info;

use crate::archive::{Archiver, TarArchiver};
use crate::config::{GlobalConfig, HiveBackend, ARCHITECTURE, OS};
use crate::digest::{DigestComputer, Sha256Digester};
use crate::hive::{BuiltinHiveCreator, HiveCreator, RegHiveCreator};
use crate::layer_builder::{assemble_layer, purge_output};
use crate::metadata::{
    emit_image_config, emit_layer_metadata, emit_manifest, ContainerConfig, ImageMetadata,
    LAYER_TAR, MANIFEST_JSON,
};
use crate::util::{epoch_filetime, format_created};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    pub layer_hash: String,
    pub config_hash: String,
    pub archive: PathBuf,
    pub image_id_file: PathBuf,
}

/// Build with the configured hive backend, the tar archiver and SHA-256.
///
/// Hive headers and tar mtimes come from `layer_epoch`, so `created` only
/// reaches the image config and the per-layer `json`.
pub fn run(global_conf: &GlobalConfig) -> Result<BuiltImage> {
    let mut hives: Box<dyn HiveCreator> = match global_conf.hive_backend {
        HiveBackend::Reg => Box::new(RegHiveCreator::default()),
        HiveBackend::Builtin => {
            Box::new(BuiltinHiveCreator::new(epoch_filetime(global_conf.layer_epoch())))
        }
    };
    let archiver = TarArchiver::new(Some(global_conf.layer_epoch()));
    build_image(global_conf, hives.as_mut(), &archiver, &Sha256Digester)
}

/// Purge, assemble the layer, emit metadata and package the image.
///
/// Stages run strictly in order; the first failure aborts the build.
pub fn build_image(
    global_conf: &GlobalConfig,
    hives: &mut dyn HiveCreator,
    archiver: &dyn Archiver,
    digester: &dyn DigestComputer,
) -> Result<BuiltImage> {
    hives.check_preconditions()?;

    purge_output(&global_conf.output)?;

    let layer_tar = assemble_layer(global_conf, hives, archiver)?;
    let layer_hash = digester.digest_file(&layer_tar)?;
    info!(layer = %layer_hash, "Layer addressed");

    let image_dir = global_conf.image_dir();
    let layer_dir = image_dir.join(&layer_hash);
    fs::create_dir_all(&layer_dir).with_context(|| format!("Creating {:?}", layer_dir))?;
    let layer_dest = layer_dir.join(LAYER_TAR);
    fs::rename(&layer_tar, &layer_dest)
        .with_context(|| format!("Moving {:?} to {:?}", layer_tar, layer_dest))?;

    let meta = ImageMetadata {
        created: format_created(&global_conf.created),
        architecture: ARCHITECTURE.to_string(),
        os: OS.to_string(),
        runtime: ContainerConfig::runtime(&global_conf.user, &global_conf.cmd),
        tags: global_conf.tags.clone(),
    };

    emit_layer_metadata(&layer_dir, &meta, &layer_hash)?;
    let config_hash = emit_image_config(&image_dir, &meta, &layer_hash, digester)?;
    emit_manifest(&image_dir, &meta, &config_hash, &layer_hash)?;

    package_image(global_conf, archiver, &image_dir, &layer_hash, &config_hash)?;

    Ok(BuiltImage {
        layer_hash,
        config_hash,
        archive: global_conf.image_archive(),
        image_id_file: global_conf.image_id_file(),
    })
}

/// Archive the image directory's contents, not the directory itself, then
/// record the config hash for automation.
pub fn package_image(
    global_conf: &GlobalConfig,
    archiver: &dyn Archiver,
    image_dir: &Path,
    layer_hash: &str,
    config_hash: &str,
) -> Result<()> {
    let config_file = format!("{}.json", config_hash);
    let archive = global_conf.image_archive();
    archiver.archive(&archive, image_dir, &[layer_hash, config_file.as_str(), MANIFEST_JSON])?;
    info!(path = %archive.display(), "Image archived");

    let id_file = global_conf.image_id_file();
    fs::write(&id_file, config_hash).with_context(|| format!("Writing {:?}", id_file))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use chrono::DateTime;

    use crate::error::BuildError;
    use crate::hive::{validate_hive, HIVE_NAMES};
    use crate::metadata::{ImageConfig, LayerJson, ManifestEntry};

    struct FailSam(BuiltinHiveCreator);

    impl HiveCreator for FailSam {
        fn load(&mut self, key: &str, path: &Path) -> Result<(), BuildError> {
            if key.contains("-SAM-") {
                return Err(BuildError::HiveLoad {
                    key: key.to_string(),
                    path: path.to_path_buf(),
                    status: 1,
                });
            }
            self.0.load(key, path)
        }

        fn unload(&mut self, key: &str) -> Result<(), BuildError> {
            self.0.unload(key)
        }
    }

    struct EmptyHives;

    impl HiveCreator for EmptyHives {
        fn load(&mut self, _key: &str, path: &Path) -> Result<(), BuildError> {
            fs::write(path, b"")?;
            Ok(())
        }

        fn unload(&mut self, _key: &str) -> Result<(), BuildError> {
            Ok(())
        }
    }

    struct NotElevated;

    impl HiveCreator for NotElevated {
        fn check_preconditions(&self) -> Result<(), BuildError> {
            Err(BuildError::Precondition {
                message: "not elevated".to_string(),
                remediation: "elevate".to_string(),
            })
        }

        fn load(&mut self, _key: &str, _path: &Path) -> Result<(), BuildError> {
            unreachable!()
        }

        fn unload(&mut self, _key: &str) -> Result<(), BuildError> {
            unreachable!()
        }
    }

    fn conf(root: &Path) -> GlobalConfig {
        fs::write(root.join("LICENSE"), b"MIT License").unwrap();
        fs::write(root.join("NOTICE"), b"Third party notices").unwrap();
        let mut conf = GlobalConfig::new(root, DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        conf.hive_backend = HiveBackend::Builtin;
        conf
    }

    fn build(conf: &GlobalConfig) -> Result<BuiltImage> {
        run(conf)
    }

    fn extract(archive: &Path, dest: &Path) {
        fs::create_dir_all(dest).unwrap();
        tar::Archive::new(fs::File::open(archive).unwrap())
            .unpack(dest)
            .unwrap();
    }

    #[test]
    fn hashes_agree_across_documents() {
        let dir = tempfile::tempdir().unwrap();
        let conf = conf(dir.path());
        let built = build(&conf).unwrap();

        let out = dir.path().join("extracted");
        extract(&built.archive, &out);

        let manifest: Vec<ManifestEntry> =
            serde_json::from_slice(&fs::read(out.join("manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].config, format!("{}.json", built.config_hash));
        assert_eq!(manifest[0].layers, vec![format!("{}/layer.tar", built.layer_hash)]);

        let config_path = out.join(&manifest[0].config);
        assert_eq!(
            Sha256Digester.digest_file(&config_path).unwrap(),
            built.config_hash
        );
        let layer_path = out.join(&manifest[0].layers[0]);
        assert_eq!(
            Sha256Digester.digest_file(&layer_path).unwrap(),
            built.layer_hash
        );

        let config: ImageConfig =
            serde_json::from_slice(&fs::read(&config_path).unwrap()).unwrap();
        assert_eq!(
            config.rootfs.diff_ids,
            vec![format!("sha256:{}", built.layer_hash)]
        );

        let layer_json: LayerJson = serde_json::from_slice(
            &fs::read(out.join(&built.layer_hash).join("json")).unwrap(),
        )
        .unwrap();
        assert_eq!(layer_json.id, built.layer_hash);
        assert_eq!(layer_json.created, config.created);
        assert_eq!(config.history[0].created, config.created);
        assert_eq!(
            fs::read(out.join(&built.layer_hash).join("VERSION")).unwrap(),
            b"1.0"
        );

        assert_eq!(
            fs::read_to_string(&built.image_id_file).unwrap(),
            built.config_hash
        );
    }

    #[test]
    fn archive_root_is_the_image_layout() {
        let dir = tempfile::tempdir().unwrap();
        let conf = conf(dir.path());
        let built = build(&conf).unwrap();

        let out = dir.path().join("extracted");
        extract(&built.archive, &out);

        let top: BTreeSet<String> = fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        let expected: BTreeSet<String> = [
            "manifest.json".to_string(),
            format!("{}.json", built.config_hash),
            built.layer_hash.clone(),
        ]
        .into_iter()
        .collect();
        assert_eq!(top, expected);

        let layer_entries: BTreeSet<String> = fs::read_dir(out.join(&built.layer_hash))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            layer_entries,
            ["VERSION", "json", "layer.tar"]
                .iter()
                .map(|s| s.to_string())
                .collect::<BTreeSet<String>>()
        );
    }

    #[test]
    fn layer_carries_valid_hives() {
        let dir = tempfile::tempdir().unwrap();
        let conf = conf(dir.path());
        let built = build(&conf).unwrap();

        let out = dir.path().join("layer");
        extract(
            &conf.image_dir().join(&built.layer_hash).join("layer.tar"),
            &out,
        );
        for name in HIVE_NAMES {
            let hive = out.join("Files/Windows/System32/config").join(name);
            assert!(fs::metadata(&hive).unwrap().len() > 0, "{}", name);
            validate_hive(&hive).unwrap();
        }
        assert_eq!(fs::read(out.join("Files/LICENSE")).unwrap(), b"MIT License");
    }

    #[test]
    fn rebuild_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let conf = conf(dir.path());

        let first = build(&conf).unwrap();
        let second = build(&conf).unwrap();

        assert_eq!(first.layer_hash, second.layer_hash);
        assert_eq!(first.config_hash, second.config_hash);
        assert!(second.archive.exists());
        assert!(!conf.output.join("layer.tar").exists());
    }

    #[test]
    fn build_time_never_reaches_the_layer() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = conf(dir.path());
        assert_eq!(conf.source_date_epoch, None);
        let first = build(&conf).unwrap();

        conf.created = conf.created + chrono::Duration::seconds(100);
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let second = build(&conf).unwrap();

        assert_eq!(first.layer_hash, second.layer_hash);
        assert_ne!(first.config_hash, second.config_hash);
    }

    #[test]
    fn source_date_epoch_pins_layer_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = conf(dir.path());
        conf.source_date_epoch = Some(1_234_567_890);
        let built = build(&conf).unwrap();

        let mut archive = tar::Archive::new(
            fs::File::open(conf.image_dir().join(&built.layer_hash).join("layer.tar")).unwrap(),
        );
        for entry in archive.entries().unwrap() {
            assert_eq!(entry.unwrap().header().mtime().unwrap(), 1_234_567_890);
        }
    }

    #[test]
    fn failed_sam_load_leaves_no_image_id() {
        let dir = tempfile::tempdir().unwrap();
        let conf = conf(dir.path());
        build(&conf).unwrap();
        assert!(conf.image_id_file().exists());

        let err = build_image(
            &conf,
            &mut FailSam(BuiltinHiveCreator::new(0)),
            &TarArchiver::new(None),
            &Sha256Digester,
        )
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::HiveLoad { .. })
        ));
        assert!(!conf.image_id_file().exists());
        assert!(!conf.image_archive().exists());
    }

    #[test]
    fn zero_byte_hive_fails_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let conf = conf(dir.path());

        let err = build_image(
            &conf,
            &mut EmptyHives,
            &TarArchiver::new(None),
            &Sha256Digester,
        )
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Validation { .. })
        ));
        assert!(!conf.image_id_file().exists());
    }

    #[test]
    fn precondition_failure_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let conf = conf(dir.path());
        fs::create_dir_all(&conf.output).unwrap();
        fs::write(conf.output.join("keep"), b"previous").unwrap();

        let err = build_image(
            &conf,
            &mut NotElevated,
            &TarArchiver::new(None),
            &Sha256Digester,
        )
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Precondition { .. })
        ));
        assert!(conf.output.join("keep").exists());
    }

    #[test]
    fn tags_land_in_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = conf(dir.path());
        conf.tags = vec!["hpc-base:1.0".to_string()];
        build(&conf).unwrap();

        let manifest: serde_json::Value = serde_json::from_slice(
            &fs::read(conf.image_dir().join("manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest[0]["RepoTags"], serde_json::json!(["hpc-base:1.0"]));
    }
}
