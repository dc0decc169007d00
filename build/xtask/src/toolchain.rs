// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::config::Config;

/// Program name a project gets when it doesn't pick one.
pub const PROGNAME_SENTINEL: &str = "program";

/// What the sentinel program name is replaced with.
pub const DEFAULT_PROGNAME: &str = "firmware";

pub const PROGSUFFIX: &str = "elf";

const TOOL_PREFIX: &str = "ba-elf-";

/// Code generation options for the BA2 core in JN51xx parts.
///
/// Objects built with one set of these and linked with another are not ABI
/// compatible, so both `ccflags` and `linkflags` are derived from this list.
pub const ABI_FLAGS: &[&str] = &[
    "-march=ba2",
    "-mcpu=jn51xx",
    "-mredzone-size=4",
    "-mbranch-cost=3",
    "-fomit-frame-pointer",
    "-Os",
    "-fshort-enums",
];

/// Compile-only warnings and section placement.
const CC_FLAGS: &[&str] = &[
    "-Wall",
    "-Wpacked",
    "-Wcast-align",
    "-fdata-sections",
    "-ffunction-sections",
];

const LTO_FLAG: &str = "-flto";

/// Paths of the cross tools for the `ba-elf` triple.
#[derive(Clone, Debug)]
pub struct Tools {
    pub ar: PathBuf,
    pub as_: PathBuf,
    pub cc: PathBuf,
    pub cxx: PathBuf,
    pub gdb: PathBuf,
    pub objcopy: PathBuf,
    pub ranlib: PathBuf,
    pub size: PathBuf,
}

impl Tools {
    /// Every tool with its short name, in a fixed order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Path)> {
        [
            ("ar", &self.ar),
            ("as", &self.as_),
            ("gcc", &self.cc),
            ("g++", &self.cxx),
            ("gdb", &self.gdb),
            ("objcopy", &self.objcopy),
            ("ranlib", &self.ranlib),
            ("size", &self.size),
        ]
        .into_iter()
        .map(|(name, path)| (name, path.as_path()))
    }

    /// Tools are looked up on `PATH` unless a toolchain directory is given.
    pub fn new(dir: Option<&Path>) -> Self {
        let tool = |name: &str| {
            let exe = format!("{}{}", TOOL_PREFIX, name);
            match dir {
                Some(dir) => dir.join(exe),
                None => PathBuf::from(exe),
            }
        };
        Tools {
            ar: tool("ar"),
            as_: tool("as"),
            cc: tool("gcc"),
            cxx: tool("g++"),
            gdb: tool("gdb"),
            objcopy: tool("objcopy"),
            ranlib: tool("ranlib"),
            size: tool("size"),
        }
    }
}

/// Everything needed to drive the cross toolchain. Built once from the
/// project configuration and never changed afterwards.
#[derive(Clone, Debug)]
pub struct ToolchainProfile {
    pub tools: Tools,
    pub ccflags: Vec<String>,
    pub linkflags: Vec<String>,
    pub progname: String,
}

impl ToolchainProfile {
    pub fn new(cfg: &Config) -> Self {
        let mut ccflags: Vec<String> =
            ABI_FLAGS.iter().chain(CC_FLAGS).map(|s| s.to_string()).collect();
        let mut linkflags: Vec<String> =
            ABI_FLAGS.iter().map(|s| s.to_string()).collect();
        if cfg.lto {
            ccflags.push(LTO_FLAG.to_string());
            linkflags.push(LTO_FLAG.to_string());
        }

        ToolchainProfile {
            tools: Tools::new(cfg.toolchain_dir.as_deref()),
            ccflags,
            linkflags,
            progname: resolve_progname(&cfg.progname),
        }
    }

    /// Name of the linked image, e.g. `firmware.elf`.
    pub fn elf_name(&self) -> String {
        format!("{}.{}", self.progname, PROGSUFFIX)
    }
}

/// Projects that leave the program name at its default get `firmware`.
pub fn resolve_progname(requested: &str) -> String {
    if requested == PROGNAME_SENTINEL {
        DEFAULT_PROGNAME.to_string()
    } else {
        requested.to_string()
    }
}

/// Runs a tool to completion with inherited stdio, so that its own
/// diagnostics are what the user sees when it fails.
pub fn run(cmd: &mut Command, what: &str) -> Result<()> {
    log::debug!("{:?}", cmd);
    let status = cmd
        .status()
        .with_context(|| format!("failed to run {} ({:?})", what, cmd))?;
    if !status.success() {
        bail!("{} failed ({}), see output for details", what, status);
    }
    Ok(())
}

/// Like [`run`], but captures and returns stdout.
pub fn output(cmd: &mut Command, what: &str) -> Result<String> {
    log::debug!("{:?}", cmd);
    let out = cmd
        .stderr(std::process::Stdio::inherit())
        .output()
        .with_context(|| format!("failed to run {} ({:?})", what, cmd))?;
    if !out.status.success() {
        bail!("{} failed ({}), see output for details", what, out.status);
    }
    Ok(String::from_utf8(out.stdout)?)
}
