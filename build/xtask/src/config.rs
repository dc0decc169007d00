// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::hash_map::DefaultHasher;
use std::env;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::toolchain::PROGNAME_SENTINEL;

/// Environment variable naming a directory that holds one subdirectory per
/// tool package, used when a package is missing from `[packages]`.
pub const PACKAGES_DIR_ENV: &str = "JN51XX_PACKAGES_DIR";

/// A `RawConfig` represents a project file that has been deserialized, but
/// whose paths have not yet been resolved against the project directory.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    #[serde(default = "default_progname")]
    progname: String,
    #[serde(default = "default_build_dir")]
    build_dir: PathBuf,
    #[serde(default = "default_src_dir")]
    src_dir: PathBuf,
    #[serde(default)]
    include_dirs: Vec<PathBuf>,
    #[serde(default)]
    defines: Vec<String>,
    linker_script: Option<PathBuf>,
    #[serde(default)]
    libs: Vec<String>,
    #[serde(default)]
    lib_dirs: Vec<PathBuf>,
    #[serde(default, rename = "library")]
    libraries: Vec<Library>,
    toolchain_dir: Option<PathBuf>,
    #[serde(default)]
    lto: bool,
    board: Board,
    #[serde(default)]
    objcopy: Objcopy,
    #[serde(default)]
    upload: Upload,
    #[serde(default)]
    packages: IndexMap<String, PathBuf>,
}

fn default_progname() -> String {
    PROGNAME_SENTINEL.to_string()
}

fn default_build_dir() -> PathBuf {
    PathBuf::from("target").join("jn51xx")
}

fn default_src_dir() -> PathBuf {
    PathBuf::from("src")
}

/// Loaded project configuration, with every path made relative to the
/// directory holding the project file rather than the working directory.
#[derive(Clone, Debug)]
pub struct Config {
    pub progname: String,
    pub build_dir: PathBuf,
    pub src_dir: PathBuf,
    pub include_dirs: Vec<PathBuf>,
    pub defines: Vec<String>,
    pub linker_script: Option<PathBuf>,
    pub libs: Vec<String>,
    pub lib_dirs: Vec<PathBuf>,
    pub libraries: Vec<Library>,
    pub toolchain_dir: Option<PathBuf>,
    pub lto: bool,
    pub board: Board,
    pub objcopy: Objcopy,
    pub upload: Upload,
    pub packages: IndexMap<String, PathBuf>,
    pub buildhash: u64,
    pub path: PathBuf,
}

impl Config {
    pub fn from_file(cfg: &Path) -> Result<Self> {
        let cfg_contents = std::fs::read_to_string(cfg)
            .with_context(|| format!("could not read {}", cfg.display()))?;
        let toml: RawConfig = toml::from_str(&cfg_contents)
            .with_context(|| format!("could not parse {}", cfg.display()))?;

        let mut hasher = DefaultHasher::new();
        hasher.write(cfg_contents.as_bytes());
        let buildhash = hasher.finish();

        let root = cfg
            .parent()
            .ok_or_else(|| anyhow!("could not get project directory"))?;

        Ok(Config {
            progname: toml.progname,
            build_dir: root.join(&toml.build_dir),
            src_dir: root.join(&toml.src_dir),
            include_dirs: toml
                .include_dirs
                .iter()
                .map(|p| root.join(p))
                .collect(),
            defines: toml.defines,
            linker_script: toml.linker_script.map(|p| root.join(p)),
            libs: toml.libs,
            lib_dirs: toml.lib_dirs.iter().map(|p| root.join(p)).collect(),
            libraries: toml
                .libraries
                .into_iter()
                .map(|lib| Library {
                    src_dir: root.join(&lib.src_dir),
                    name: lib.name,
                })
                .collect(),
            toolchain_dir: toml.toolchain_dir.map(|p| root.join(p)),
            lto: toml.lto,
            board: toml.board,
            objcopy: toml.objcopy,
            upload: toml.upload,
            packages: toml
                .packages
                .into_iter()
                .map(|(name, dir)| (name, root.join(dir)))
                .collect(),
            buildhash,
            path: cfg.to_path_buf(),
        })
    }

    /// Directory holding the object files for the program and its libraries.
    pub fn obj_dir(&self) -> PathBuf {
        self.build_dir.join("obj")
    }

    /// Looks up the install directory of a tool package, first in the
    /// `[packages]` table and then under `$JN51XX_PACKAGES_DIR`.
    pub fn package_dir(&self, name: &str) -> Result<PathBuf> {
        if let Some(dir) = self.packages.get(name) {
            return Ok(dir.clone());
        }
        match env::var_os(PACKAGES_DIR_ENV) {
            Some(root) => Ok(PathBuf::from(root).join(name)),
            None => bail!(
                "package '{}' is not listed in [packages] of {} and {} is not set",
                name,
                self.path.display(),
                PACKAGES_DIR_ENV,
            ),
        }
    }
}

/// Board description. This is read-only metadata; nothing in the pipeline
/// tries to work out which board is attached.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Board {
    pub name: String,
    pub mcu: Option<String>,
    pub max_flash_size: Option<u64>,
    pub max_ram_size: Option<u64>,
    pub upload_speed: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Library {
    pub name: String,
    pub src_dir: PathBuf,
}

/// Options for turning the ELF into a flash image.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Objcopy {
    /// Copy only `sections` into the image. Off by default, in which case
    /// every section (vendor ones included) lands in the image as-is.
    pub filter_sections: bool,
    pub sections: Vec<String>,
    /// Pass `-S` to drop symbol and relocation information.
    pub strip_all: bool,
}

/// Sections making up a JN51xx flash image, in image order.
pub const IMAGE_SECTIONS: &[&str] = &[
    ".version",
    ".bir",
    ".flashheader",
    ".vsr_table",
    ".vsr_handlers",
    ".rodata",
    ".text",
    ".data",
    ".bss",
    ".heap",
    ".stack",
];

impl Default for Objcopy {
    fn default() -> Self {
        Objcopy {
            filter_sections: false,
            sections: IMAGE_SECTIONS.iter().map(|s| s.to_string()).collect(),
            strip_all: false,
        }
    }
}

/// Serial upload settings. The destructive switches all default to off.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Upload {
    /// Serial port, or `auto` (the default) to search for one.
    pub port: Option<String>,
    pub speed: Option<u32>,
    /// Glob patterns searched when the port is `auto`; empty means the
    /// host's usual serial device names.
    pub port_patterns: Vec<String>,
    pub erase_flash: bool,
    pub erase_eeprom: bool,
    pub device_config: bool,
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn load(text: &str) -> Result<Config> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("jn51xx.toml");
        std::fs::write(&path, text)?;
        Config::from_file(&path)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = load(indoc! {r#"
            [board]
            name = "jn5148-dk"
        "#})
        .unwrap();

        assert_eq!(cfg.progname, PROGNAME_SENTINEL);
        assert!(cfg.build_dir.ends_with("target/jn51xx"));
        assert!(cfg.src_dir.ends_with("src"));
        assert!(!cfg.lto);
        assert!(!cfg.objcopy.filter_sections);
        assert!(!cfg.objcopy.strip_all);
        assert_eq!(cfg.objcopy.sections.len(), IMAGE_SECTIONS.len());
        assert!(cfg.upload.port.is_none());
        assert!(!cfg.upload.erase_flash);
        assert!(!cfg.upload.erase_eeprom);
        assert!(!cfg.upload.device_config);
        assert!(!cfg.upload.force);
    }

    #[test]
    fn paths_are_relative_to_the_project_file() {
        let cfg = load(indoc! {r#"
            build-dir = "out"
            include-dirs = ["include"]
            linker-script = "link/app.ld"

            [board]
            name = "jn5168"
            max-flash-size = 262144
            max-ram-size = 32768

            [packages]
            tool-nxp-jn51prog = "tools/jn51prog"
        "#})
        .unwrap();

        let root = cfg.path.parent().unwrap();
        assert_eq!(cfg.build_dir, root.join("out"));
        assert_eq!(cfg.include_dirs, vec![root.join("include")]);
        assert_eq!(cfg.linker_script, Some(root.join("link/app.ld")));
        assert_eq!(
            cfg.package_dir("tool-nxp-jn51prog").unwrap(),
            root.join("tools/jn51prog")
        );
        assert_eq!(cfg.board.max_flash_size, Some(262144));
        assert_eq!(cfg.board.max_ram_size, Some(32768));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = load(indoc! {r#"
            [board]
            name = "jn5148-dk"
            flash = 1
        "#})
        .unwrap_err();
        assert!(format!("{err:#}").contains("unknown field"));
    }

    #[test]
    fn libraries_are_listed_in_order() {
        let cfg = load(indoc! {r#"
            [board]
            name = "jn5148-dk"

            [[library]]
            name = "zigbee"
            src-dir = "lib/zigbee"

            [[library]]
            name = "hal"
            src-dir = "lib/hal"
        "#})
        .unwrap();

        let names: Vec<_> =
            cfg.libraries.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["zigbee", "hal"]);
        assert!(cfg.libraries[1].src_dir.ends_with("lib/hal"));
    }

    #[test]
    fn changing_the_file_changes_the_buildhash() {
        let a = load("[board]\nname = \"a\"\n").unwrap();
        let b = load("[board]\nname = \"a\"\nmax-ram-size = 1\n").unwrap();
        assert_ne!(a.buildhash, b.buildhash);
    }

    #[test]
    fn sample_project_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../demos/jn5148-dk/jn51xx.toml");
        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.board.name, "jn5148-dk");
        assert_eq!(cfg.board.max_flash_size, Some(131072));
        assert_eq!(cfg.upload.port.as_deref(), Some("auto"));
        assert!(cfg.linker_script.is_none());
        assert!(cfg.include_dirs[0].ends_with("include"));
    }
}
