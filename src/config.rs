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
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Deserialize;

use crate::logging::LogFormat;
use crate::metadata::LAYER_TAR;
use crate::util::{build_timestamp, get_source_date_epoch};

pub const DEFAULT_IMAGE_NAME: &str = "windows-host-process-containers-base-image.tar";
pub const IMAGE_ID_FILE: &str = "image-id.txt";
pub const DEFAULT_USER: &str = "ContainerUser";
pub const DEFAULT_CMD: &str = "cmd.exe";
pub const ARCHITECTURE: &str = "amd64";
pub const OS: &str = "windows";
/// Layer timestamp when `SOURCE_DATE_EPOCH` is unset: 2000-01-01T00:00:00Z.
pub const DEFAULT_LAYER_EPOCH: u64 = 946_684_800;

const STAGING_DIR: &str = "staging";
const IMAGE_DIR: &str = "image";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HiveBackend {
    /// `reg.exe load` / `reg.exe unload`, Windows only.
    Reg,
    /// In-process hive writer.
    Builtin,
}

impl Default for HiveBackend {
    fn default() -> Self {
        if cfg!(windows) {
            HiveBackend::Reg
        } else {
            HiveBackend::Builtin
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "hpc-base-image", version, about = "Build the Windows host process containers base image")]
pub struct Cli {
    /// YAML build file, `-` for stdin
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Build output directory, purged before every build
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// License file to ship at the layer root (repeatable)
    #[arg(long = "license")]
    pub licenses: Vec<PathBuf>,

    /// How registry hives are created [default: reg on Windows, builtin elsewhere]
    #[arg(long, value_enum)]
    pub hive_backend: Option<HiveBackend>,

    /// Repository tag recorded in manifest.json (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "HPC_BASE_IMAGE_LOG_FORMAT")]
    pub log_format: LogFormat,
}

/// Optional YAML build file. Relative paths resolve against the file's
/// directory, or the working directory when read from stdin.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct BuildFile {
    pub output: Option<PathBuf>,
    pub licenses: Option<Vec<PathBuf>>,
    pub hive_backend: Option<HiveBackend>,
    pub user: Option<String>,
    pub cmd: Option<Vec<String>>,
    pub tags: Vec<String>,
    pub image_name: Option<String>,
}

impl BuildFile {
    pub fn parse(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(BuildFile::default());
        }
        Ok(serde_yaml::from_str(input)?)
    }

    /// Returns the file and the directory its relative paths hang off.
    pub fn load(path: &Path, cwd: &Path) -> Result<(Self, PathBuf)> {
        if path == Path::new("-") {
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input)?;
            return Ok((Self::parse(&input)?, cwd.to_path_buf()));
        }
        let path = absolutize(path, cwd);
        let input =
            fs::read_to_string(&path).with_context(|| format!("Reading build file {:?}", path))?;
        let file = Self::parse(&input).with_context(|| format!("Parsing build file {:?}", path))?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.to_path_buf());
        Ok((file, base))
    }
}

/// Fully resolved settings handed to every stage. All paths are absolute.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub output: PathBuf,
    pub licenses: Vec<PathBuf>,
    pub hive_backend: HiveBackend,
    pub user: String,
    pub cmd: Vec<String>,
    pub tags: Vec<String>,
    pub image_name: String,
    pub created: DateTime<Utc>,
    /// Pins layer timestamps when set.
    pub source_date_epoch: Option<u64>,
}

impl GlobalConfig {
    /// Defaults for a build rooted at `cwd`.
    pub fn new(cwd: &Path, created: DateTime<Utc>) -> Self {
        GlobalConfig {
            output: cwd.join("build"),
            licenses: vec![cwd.join("LICENSE"), cwd.join("NOTICE")],
            hive_backend: HiveBackend::default(),
            user: DEFAULT_USER.to_string(),
            cmd: vec![DEFAULT_CMD.to_string()],
            tags: Vec::new(),
            image_name: DEFAULT_IMAGE_NAME.to_string(),
            created,
            source_date_epoch: None,
        }
    }

    /// Defaults, then the build file, then the command line.
    pub fn resolve(cli: &Cli, cwd: &Path) -> Result<Self> {
        let mut conf = GlobalConfig::new(cwd, build_timestamp()?);
        conf.source_date_epoch = get_source_date_epoch();

        if let Some(ref path) = cli.config {
            let (file, base) = BuildFile::load(path, cwd)?;
            conf.apply_file(file, &base)?;
        }

        if let Some(ref output) = cli.output {
            conf.output = absolutize(output, cwd);
        }
        if !cli.licenses.is_empty() {
            conf.licenses = cli.licenses.iter().map(|p| absolutize(p, cwd)).collect();
        }
        if let Some(backend) = cli.hive_backend {
            conf.hive_backend = backend;
        }
        if !cli.tags.is_empty() {
            conf.tags = cli.tags.clone();
        }

        if cwd.starts_with(&conf.output) {
            bail!(
                "Refusing to use {:?} as output: it contains the working directory and is purged on every build",
                conf.output
            );
        }

        Ok(conf)
    }

    pub fn apply_file(&mut self, file: BuildFile, base: &Path) -> Result<()> {
        if let Some(output) = file.output {
            self.output = absolutize(&output, base);
        }
        if let Some(licenses) = file.licenses {
            self.licenses = licenses.iter().map(|p| absolutize(p, base)).collect();
        }
        if let Some(backend) = file.hive_backend {
            self.hive_backend = backend;
        }
        if let Some(user) = file.user {
            self.user = user;
        }
        if let Some(cmd) = file.cmd {
            self.cmd = cmd;
        }
        if !file.tags.is_empty() {
            self.tags = file.tags;
        }
        if let Some(name) = file.image_name {
            validate_image_name(&name)?;
            self.image_name = name;
        }
        Ok(())
    }

    /// Unix seconds stamped into everything inside the layer. Never the
    /// build time, so the layer digest only moves when its contents do.
    pub fn layer_epoch(&self) -> u64 {
        self.source_date_epoch.unwrap_or(DEFAULT_LAYER_EPOCH)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.output.join(STAGING_DIR)
    }

    pub fn image_dir(&self) -> PathBuf {
        self.output.join(IMAGE_DIR)
    }

    pub fn image_archive(&self) -> PathBuf {
        self.output.join(&self.image_name)
    }

    pub fn image_id_file(&self) -> PathBuf {
        self.output.join(IMAGE_ID_FILE)
    }
}

/// The image archive sits directly in the output directory, next to the
/// build's own working entries.
pub fn validate_image_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single || name.contains(['/', '\\']) {
        bail!("Image name {:?} must be a plain file name", name);
    }
    if [STAGING_DIR, IMAGE_DIR, LAYER_TAR, IMAGE_ID_FILE].contains(&name) {
        bail!("Image name {:?} collides with the build layout", name);
    }
    Ok(())
}

/// Join onto `base` and fold `.` and `..` lexically.
pub fn absolutize(path: &Path, base: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
