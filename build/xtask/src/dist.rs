// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};

use crate::actions::ActionRegistry;
use crate::compile::{self, Compiler};
use crate::config::Config;
use crate::flash::{self, UploadArgs};
use crate::launch::Launcher;
use crate::sizes::{self, SizeReport};
use crate::toolchain::ToolchainProfile;

/// The named targets a user can ask for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// Use the images left by an earlier build instead of building.
    Nobuild,
    /// Compile, link and package the firmware.
    Buildprog,
    /// Print the size of the firmware.
    Size,
    /// Flash the firmware onto a board.
    Upload,
}

/// What runs when no targets are named.
pub const DEFAULT_TARGETS: &[Target] = &[Target::Buildprog, Target::Size];

impl Target {
    const ALL: [Target; 4] =
        [Target::Nobuild, Target::Buildprog, Target::Size, Target::Upload];

    pub fn name(self) -> &'static str {
        match self {
            Target::Nobuild => "nobuild",
            Target::Buildprog => "buildprog",
            Target::Size => "size",
            Target::Upload => "upload",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Target {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Target::ALL.into_iter().find(|t| t.name() == s).ok_or_else(|| {
            anyhow!(
                "unknown target '{}'; expected one of nobuild, buildprog, \
                 size, upload",
                s
            )
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    Elf,
    Bin,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArtifactKind::Elf => "ELF image",
            ArtifactKind::Bin => "binary image",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub kind: ArtifactKind,
}

/// Drives the build for one invocation. Each image is produced at most
/// once and then shared by every target that needs it.
pub struct Pipeline<'a> {
    cfg: &'a Config,
    profile: ToolchainProfile,
    actions: ActionRegistry,
    upload: UploadArgs,
    launcher: Box<dyn Launcher>,
    nobuild: bool,
    elf: Option<Artifact>,
    /// Whether this run relinked the ELF.
    relinked: bool,
    bin: Option<Artifact>,
    size: Option<SizeReport>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        cfg: &'a Config,
        upload: UploadArgs,
        launcher: Box<dyn Launcher>,
    ) -> Self {
        let profile = ToolchainProfile::new(cfg);
        for (name, path) in profile.tools.iter() {
            log::debug!("{}: {}", name, path.display());
        }
        Pipeline {
            cfg,
            profile,
            actions: ActionRegistry::new(&cfg.objcopy),
            upload,
            launcher,
            nobuild: false,
            elf: None,
            relinked: false,
            bin: None,
            size: None,
        }
    }

    /// `<build-dir>/<progname>.elf`
    pub fn elf_path(&self) -> PathBuf {
        self.cfg.build_dir.join(self.profile.elf_name())
    }

    /// `<build-dir>/<progname>.bin`
    pub fn bin_path(&self) -> Result<PathBuf> {
        let base = self.cfg.build_dir.join(&self.profile.progname);
        Ok(self.actions.get("ElfToBin")?.target_for(&base))
    }

    /// Runs `targets` in order. The first failure stops everything after
    /// it.
    pub fn run(&mut self, targets: &[Target]) -> Result<()> {
        let mut seen = vec![];
        for &t in targets {
            if !seen.contains(&t) {
                seen.push(t);
            }
        }
        self.nobuild = seen.contains(&Target::Nobuild);

        for target in seen {
            log::debug!("target: {}", target);
            match target {
                Target::Nobuild | Target::Buildprog => {
                    self.bin()?;
                }
                Target::Size => {
                    let elf = self.elf()?;
                    sizes::print(&self.profile, &elf.path)?;
                }
                Target::Upload => {
                    let bin = self.bin()?;
                    flash::run(
                        self.cfg,
                        &self.upload,
                        &bin.path,
                        self.launcher.as_ref(),
                    )?;
                }
            }
        }
        if let Some(size) = self.size {
            log::debug!(
                "program {} bytes, data {} bytes",
                size.program,
                size.data
            );
        }
        Ok(())
    }

    /// The linked image, built if needed.
    pub fn elf(&mut self) -> Result<Artifact> {
        if let Some(elf) = &self.elf {
            return Ok(elf.clone());
        }
        let elf = Artifact {
            path: self.elf_path(),
            kind: ArtifactKind::Elf,
        };
        if self.nobuild {
            require(&elf)?;
        } else {
            self.relinked = self.build_elf(&elf.path)?;
        }
        self.elf = Some(elf.clone());
        Ok(elf)
    }

    /// The flash image, always derived from the current ELF and checked
    /// against the board's budgets.
    pub fn bin(&mut self) -> Result<Artifact> {
        if let Some(bin) = &self.bin {
            return Ok(bin.clone());
        }
        let elf = self.elf()?;
        let bin = Artifact {
            path: self.bin_path()?,
            kind: ArtifactKind::Bin,
        };
        if self.nobuild {
            require(&bin)?;
        } else {
            // A fresh link always gets a fresh image, even when the file
            // times can't tell the two apart.
            let inputs = std::slice::from_ref(&elf.path);
            if self.relinked || compile::needs_rebuild(&bin.path, inputs)? {
                self.actions.invoke(
                    "ElfToBin",
                    &self.profile,
                    inputs,
                    &bin.path,
                )?;
            } else {
                log::info!("{} (unchanged)", bin.path.display());
            }
            let report =
                sizes::check(&self.profile, &self.cfg.board, &elf.path)?;
            self.size = Some(report);
        }
        self.bin = Some(bin.clone());
        Ok(bin)
    }

    /// Section totals from the last size check, if one ran.
    #[cfg(test)]
    pub fn size_report(&self) -> Option<SizeReport> {
        self.size
    }

    /// Compiles and links as needed; returns whether the linker ran.
    fn build_elf(&self, elf: &Path) -> Result<bool> {
        let cfg = self.cfg;
        match &cfg.board.mcu {
            Some(mcu) => {
                log::info!("Building for {} ({})", cfg.board.name, mcu)
            }
            None => log::info!("Building for {}", cfg.board.name),
        }
        std::fs::create_dir_all(&cfg.build_dir).with_context(|| {
            format!("could not create {}", cfg.build_dir.display())
        })?;
        check_rebuild(cfg, elf)?;

        let compiler = Compiler::new(cfg, &self.profile);
        let obj_dir = cfg.obj_dir();

        let mut archives = vec![];
        let mut cxx = false;
        for lib in &cfg.libraries {
            let lib_obj_dir = obj_dir.join("lib").join(&lib.name);
            let objects = compiler.objects(&lib.src_dir, &lib_obj_dir)?;
            if objects.is_empty() {
                bail!(
                    "library {} has no sources in {}",
                    lib.name,
                    lib.src_dir.display()
                );
            }
            cxx |= objects.iter().any(|o| compile::is_cxx_object(o));
            archives.push(compiler.archive(
                &lib.name,
                &objects,
                &cfg.build_dir,
            )?);
        }

        let objects = compiler.objects(&cfg.src_dir, &obj_dir.join("src"))?;
        if objects.is_empty() {
            bail!("no sources found in {}", cfg.src_dir.display());
        }
        compiler.link(&objects, &archives, cxx, elf)
    }
}

fn require(artifact: &Artifact) -> Result<()> {
    if !artifact.path.exists() {
        bail!(
            "{} {} does not exist; nobuild needs the images of an earlier \
             build",
            artifact.kind,
            artifact.path.display()
        );
    }
    log::info!("Using {} {}", artifact.kind, artifact.path.display());
    Ok(())
}

/// Checks the buildstamp and throws away the previous build when the
/// project file has changed since, as flags or sources may have moved.
fn check_rebuild(cfg: &Config, elf: &Path) -> Result<()> {
    let buildstamp_file = cfg.build_dir.join("buildstamp");
    let rebuild = match std::fs::read_to_string(&buildstamp_file) {
        Ok(contents) => match u64::from_str_radix(contents.trim(), 16) {
            Ok(cmp) => cfg.buildhash != cmp,
            Err(_) => {
                log::info!("buildstamp file contents unknown; re-building.");
                true
            }
        },
        Err(_) => {
            log::info!("no buildstamp file found; re-building.");
            true
        }
    };

    if rebuild {
        log::info!(
            "{} has changed; rebuilding everything",
            cfg.path.display()
        );
        let obj_dir = cfg.obj_dir();
        if obj_dir.exists() {
            std::fs::remove_dir_all(&obj_dir)?;
        }
        let archives = cfg
            .libraries
            .iter()
            .map(|lib| cfg.build_dir.join(format!("lib{}.a", lib.name)));
        for stale in std::iter::once(elf.to_path_buf()).chain(archives) {
            if stale.exists() {
                std::fs::remove_file(&stale)?;
            }
        }
    }

    std::fs::write(&buildstamp_file, format!("{:x}", cfg.buildhash))?;
    Ok(())
}
