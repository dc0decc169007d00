// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, bail, Result};
use indexmap::IndexMap;

use crate::config::Objcopy;
use crate::toolchain::{self, ToolchainProfile};

/// A named build step that turns its sources into a target file.
pub trait Action {
    fn name(&self) -> &'static str;

    /// Extension given to targets named from a bare base path.
    fn suffix(&self) -> Option<&'static str>;

    /// Progress message shown instead of the full command line.
    fn label(&self, target: &Path) -> String;

    fn run(
        &self,
        profile: &ToolchainProfile,
        sources: &[PathBuf],
        target: &Path,
    ) -> Result<()>;

    fn target_for(&self, base: &Path) -> PathBuf {
        match self.suffix() {
            Some(suffix) => {
                let mut name = OsString::from(base.as_os_str());
                name.push(".");
                name.push(suffix);
                PathBuf::from(name)
            }
            None => base.to_path_buf(),
        }
    }
}

/// Extracts a raw flash image from the linked ELF with `objcopy -O binary`.
pub struct ElfToBin {
    only_sections: Vec<String>,
    strip_all: bool,
}

impl ElfToBin {
    pub fn new(opts: &Objcopy) -> Self {
        ElfToBin {
            only_sections: if opts.filter_sections {
                opts.sections.clone()
            } else {
                vec![]
            },
            strip_all: opts.strip_all,
        }
    }

    fn args(&self, source: &Path, target: &Path) -> Vec<OsString> {
        let mut args = vec![];
        for section in &self.only_sections {
            args.push("-j".into());
            args.push(section.into());
        }
        if self.strip_all {
            args.push("-S".into());
        }
        args.push("-O".into());
        args.push("binary".into());
        args.push(source.into());
        args.push(target.into());
        args
    }
}

impl Action for ElfToBin {
    fn name(&self) -> &'static str {
        "ElfToBin"
    }

    fn suffix(&self) -> Option<&'static str> {
        Some("bin")
    }

    fn label(&self, target: &Path) -> String {
        format!("Building {}", target.display())
    }

    fn run(
        &self,
        profile: &ToolchainProfile,
        sources: &[PathBuf],
        target: &Path,
    ) -> Result<()> {
        let source = match sources {
            [source] => source,
            _ => bail!(
                "{} takes exactly one ELF image, got {}",
                self.name(),
                sources.len()
            ),
        };
        let mut cmd = Command::new(&profile.tools.objcopy);
        cmd.args(self.args(source, target));
        toolchain::run(&mut cmd, "objcopy")
    }
}

/// Placeholder for PDUM image generation. It stays registered so that
/// projects naming it still resolve, but it cannot produce anything.
pub struct PdumGen;

impl Action for PdumGen {
    fn name(&self) -> &'static str {
        "PdumGen"
    }

    fn suffix(&self) -> Option<&'static str> {
        None
    }

    fn label(&self, _target: &Path) -> String {
        "Generating PDUM...".to_string()
    }

    fn run(
        &self,
        _profile: &ToolchainProfile,
        _sources: &[PathBuf],
        _target: &Path,
    ) -> Result<()> {
        bail!("Cannot generate PDUM")
    }
}

/// The custom build actions, by name.
pub struct ActionRegistry {
    actions: IndexMap<&'static str, Box<dyn Action>>,
}

impl ActionRegistry {
    pub fn new(objcopy: &Objcopy) -> Self {
        let mut actions: IndexMap<&'static str, Box<dyn Action>> =
            IndexMap::new();
        for action in [
            Box::new(ElfToBin::new(objcopy)) as Box<dyn Action>,
            Box::new(PdumGen) as Box<dyn Action>,
        ] {
            actions.insert(action.name(), action);
        }
        ActionRegistry { actions }
    }

    pub fn get(&self, name: &str) -> Result<&dyn Action> {
        self.actions
            .get(name)
            .map(|a| a.as_ref())
            .ok_or_else(|| {
                let known: Vec<_> = self.names().collect();
                anyhow!(
                    "unknown build action '{}' (known: {})",
                    name,
                    known.join(", ")
                )
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.actions.keys().copied()
    }

    /// Runs the named action, announcing it with its label first.
    pub fn invoke(
        &self,
        name: &str,
        profile: &ToolchainProfile,
        sources: &[PathBuf],
        target: &Path,
    ) -> Result<()> {
        let action = self.get(name)?;
        log::info!("{}", action.label(target));
        action.run(profile, sources, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn profile(dir: &Path) -> ToolchainProfile {
        let path = dir.join("jn51xx.toml");
        std::fs::write(&path, "[board]\nname = \"jn5148-dk\"\n").unwrap();
        ToolchainProfile::new(&Config::from_file(&path).unwrap())
    }

    #[test]
    fn both_actions_are_registered() {
        let registry = ActionRegistry::new(&Objcopy::default());
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            ["ElfToBin", "PdumGen"]
        );
        let err = registry.get("ElfToHex").err().unwrap();
        assert_eq!(
            err.to_string(),
            "unknown build action 'ElfToHex' (known: ElfToBin, PdumGen)"
        );
    }

    #[test]
    fn elf_to_bin_copies_every_section_by_default() {
        let action = ElfToBin::new(&Objcopy::default());
        let args = action.args(Path::new("fw.elf"), Path::new("fw.bin"));
        let expected: Vec<OsString> = ["-O", "binary", "fw.elf", "fw.bin"]
            .iter()
            .map(OsString::from)
            .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn elf_to_bin_section_filter_is_opt_in() {
        let opts = Objcopy {
            filter_sections: true,
            sections: vec![".version".into(), ".text".into()],
            strip_all: true,
        };
        let args = ElfToBin::new(&opts)
            .args(Path::new("fw.elf"), Path::new("fw.bin"));
        let expected: Vec<OsString> = [
            "-j", ".version", "-j", ".text", "-S", "-O", "binary", "fw.elf",
            "fw.bin",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn elf_to_bin_names_targets_with_bin_suffix() {
        let action = ElfToBin::new(&Objcopy::default());
        assert_eq!(
            action.target_for(Path::new("out/firmware")),
            Path::new("out/firmware.bin")
        );
        assert_eq!(
            action.target_for(Path::new("out/fw.v2")),
            Path::new("out/fw.v2.bin")
        );
    }

    #[test]
    fn elf_to_bin_wants_a_single_source() {
        let dir = tempfile::tempdir().unwrap();
        let action = ElfToBin::new(&Objcopy::default());
        let err = action
            .run(&profile(dir.path()), &[], &dir.path().join("fw.bin"))
            .unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn pdum_gen_always_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("pdum.c");
        let registry = ActionRegistry::new(&Objcopy::default());

        let err = registry
            .invoke(
                "PdumGen",
                &profile(dir.path()),
                &[dir.path().join("app.oscfgdiag")],
                &target,
            )
            .unwrap_err();

        assert_eq!(err.to_string(), "Cannot generate PDUM");
        assert!(!target.exists());
    }
}
