// Copyright (c) 2019 Codethink Ltd.
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

mod archive;
mod config;
mod digest;
mod error;
mod hive;
mod image_builder;
mod layer_builder;
mod logging;
mod metadata;
mod util;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use crate::config::{Cli, GlobalConfig};

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init_logging(cli.log_format) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    report(build(&cli))
}

/// Errors are reported once, through the log, never again by the runtime.
fn report(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Build failed");
            ExitCode::FAILURE
        }
    }
}

fn build(cli: &Cli) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let global_conf = GlobalConfig::resolve(cli, &cwd)?;

    info!(
        output = %global_conf.output.display(),
        backend = ?global_conf.hive_backend,
        "Building host process containers base image"
    );

    let built = image_builder::run(&global_conf)?;
    info!(
        image = %built.archive.display(),
        config = %built.config_hash,
        layer = %built.layer_hash,
        image_id = %built.image_id_file.display(),
        "Image built"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_maps_to_exit_code_one() {
        let code = report(Err(anyhow::anyhow!("hive load failed")));
        assert_eq!(format!("{:?}", code), format!("{:?}", ExitCode::FAILURE));
        assert_eq!(
            format!("{:?}", report(Ok(()))),
            format!("{:?}", ExitCode::SUCCESS)
        );
    }
}
