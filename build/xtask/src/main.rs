// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use anyhow::Result;
use structopt::StructOpt;

mod actions;
mod compile;
mod config;
mod dist;
mod flash;
mod launch;
mod sizes;
mod toolchain;

use config::Config;
use dist::{Pipeline, Target};
use flash::UploadArgs;

#[derive(Debug, StructOpt)]
#[structopt(
    max_term_width = 80,
    about = "builds, measures and flashes JN51xx firmware"
)]
struct Xtask {
    /// Log every command we shell out to.
    #[structopt(short)]
    verbose: bool,
    /// Path to the project file, in TOML.
    #[structopt(long, default_value = "jn51xx.toml")]
    cfg: PathBuf,
    /// Serial port for `upload`, or `auto` to search for one.
    #[structopt(long)]
    upload_port: Option<String>,
    /// Baud rate for `upload`.
    #[structopt(long)]
    upload_speed: Option<u32>,
    /// What to do: nobuild, buildprog, size or upload. Defaults to
    /// `buildprog size`.
    targets: Vec<Target>,
}

fn main() -> Result<()> {
    let xtask = Xtask::from_args();

    let level = if xtask.verbose { "debug" } else { "info" };
    let env = env_logger::Env::default().filter_or("RUST_LOG", level);
    env_logger::init_from_env(env);

    let cfg = Config::from_file(&xtask.cfg)?;
    let targets: &[Target] = if xtask.targets.is_empty() {
        dist::DEFAULT_TARGETS
    } else {
        &xtask.targets
    };

    let upload = UploadArgs {
        port: xtask.upload_port,
        speed: xtask.upload_speed,
    };
    Pipeline::new(&cfg, upload, launch::for_host()).run(targets)
}
