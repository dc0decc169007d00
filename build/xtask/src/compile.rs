// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};
use filetime::FileTime;

use crate::config::Config;
use crate::toolchain::{self, ToolchainProfile};

/// Source file extensions we know how to build, searched recursively.
const SOURCE_PATTERNS: &[&str] = &["*.c", "*.cpp", "*.cc", "*.S", "*.s"];

/// Extensions compiled with the C++ driver.
const CXX_EXTENSIONS: &[&str] = &["cpp", "cc"];

/// Compiles, archives and links with the cross toolchain.
pub struct Compiler<'a> {
    cfg: &'a Config,
    profile: &'a ToolchainProfile,
}

impl<'a> Compiler<'a> {
    pub fn new(cfg: &'a Config, profile: &'a ToolchainProfile) -> Self {
        Compiler { cfg, profile }
    }

    /// `-D` and `-I` options from the project file.
    fn cppflags(&self) -> Vec<OsString> {
        let mut flags: Vec<OsString> = self
            .cfg
            .defines
            .iter()
            .map(|d| format!("-D{}", d).into())
            .collect();
        for dir in std::iter::once(&self.cfg.src_dir)
            .chain(&self.cfg.include_dirs)
        {
            let mut flag = OsString::from("-I");
            flag.push(dir);
            flags.push(flag);
        }
        flags
    }

    /// Builds one object file per source under `src_dir`, skipping objects
    /// that are newer than their source. Returns the objects in a stable
    /// order.
    pub fn objects(
        &self,
        src_dir: &Path,
        obj_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let mut objects = vec![];
        for src in sources(src_dir)? {
            let rel = src.strip_prefix(src_dir)?;
            let mut obj = OsString::from(obj_dir.join(rel));
            obj.push(".o");
            let obj = PathBuf::from(obj);

            if needs_rebuild(&obj, std::slice::from_ref(&src))? {
                self.compile(&src, &obj)?;
            } else {
                log::debug!("{} (unchanged)", obj.display());
            }
            objects.push(obj);
        }
        Ok(objects)
    }

    fn compile(&self, src: &Path, obj: &Path) -> Result<()> {
        if let Some(parent) = obj.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tools = &self.profile.tools;
        let ext = src.extension().and_then(|e| e.to_str()).unwrap_or("");
        let mut cmd = match ext {
            "c" => Command::new(&tools.cc),
            _ if CXX_EXTENSIONS.contains(&ext) => Command::new(&tools.cxx),
            "S" => {
                let mut cmd = Command::new(&tools.cc);
                cmd.arg("-x").arg("assembler-with-cpp");
                cmd
            }
            "s" => {
                log::info!("Assembling {}", src.display());
                let mut cmd = Command::new(&tools.as_);
                cmd.arg("-o").arg(obj).arg(src);
                return toolchain::run(&mut cmd, "assembler");
            }
            _ => bail!("don't know how to build {}", src.display()),
        };
        log::info!("Compiling {}", src.display());
        cmd.args(&self.profile.ccflags)
            .args(self.cppflags())
            .arg("-c")
            .arg(src)
            .arg("-o")
            .arg(obj);
        toolchain::run(&mut cmd, "compiler")
    }

    /// Bundles `objects` into `lib<name>.a` with `ar` and indexes it with
    /// `ranlib`.
    pub fn archive(
        &self,
        name: &str,
        objects: &[PathBuf],
        out_dir: &Path,
    ) -> Result<PathBuf> {
        let archive = out_dir.join(format!("lib{}.a", name));
        if !needs_rebuild(&archive, objects)? {
            log::debug!("{} (unchanged)", archive.display());
            return Ok(archive);
        }

        log::info!("Archiving {}", archive.display());
        // `ar rc` only ever adds members, so stale ones have to go first.
        if archive.exists() {
            std::fs::remove_file(&archive)?;
        }
        let mut cmd = Command::new(&self.profile.tools.ar);
        cmd.arg("rc").arg(&archive).args(objects);
        toolchain::run(&mut cmd, "archiver")?;

        log::info!("Indexing {}", archive.display());
        let mut cmd = Command::new(&self.profile.tools.ranlib);
        cmd.arg(&archive);
        toolchain::run(&mut cmd, "ranlib")?;

        Ok(archive)
    }

    /// Links `elf` if it is missing or older than any of its inputs.
    /// Returns whether the linker ran.
    ///
    /// The C++ driver links when any object came from C++, so that its
    /// runtime libraries come along; `cxx` says the same for objects that
    /// only reach the link inside `archives`.
    pub fn link(
        &self,
        objects: &[PathBuf],
        archives: &[PathBuf],
        cxx: bool,
        elf: &Path,
    ) -> Result<bool> {
        let mut inputs: Vec<PathBuf> =
            objects.iter().chain(archives).cloned().collect();
        if let Some(script) = &self.cfg.linker_script {
            inputs.push(script.clone());
        }
        if !needs_rebuild(elf, &inputs)? {
            log::info!("{} (unchanged)", elf.display());
            return Ok(false);
        }

        log::info!("Linking {}", elf.display());
        let tools = &self.profile.tools;
        let driver = if cxx || objects.iter().any(|o| is_cxx_object(o)) {
            &tools.cxx
        } else {
            &tools.cc
        };
        let mut cmd = Command::new(driver);
        cmd.arg("-o").arg(elf).args(&self.profile.linkflags);
        if let Some(script) = &self.cfg.linker_script {
            let mut flag = OsString::from("-T");
            flag.push(script);
            cmd.arg(flag);
        }
        cmd.args(objects);
        for dir in &self.cfg.lib_dirs {
            let mut flag = OsString::from("-L");
            flag.push(dir);
            cmd.arg(flag);
        }
        cmd.args(archives);
        for lib in &self.cfg.libs {
            cmd.arg(format!("-l{}", lib));
        }
        toolchain::run(&mut cmd, "linker")?;
        Ok(true)
    }
}

/// Whether an object built by [`Compiler::objects`] (named `<source>.o`)
/// came from a C++ source.
pub fn is_cxx_object(obj: &Path) -> bool {
    obj.file_stem()
        .map(Path::new)
        .and_then(|src| src.extension())
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| CXX_EXTENSIONS.contains(&ext))
}

/// Every buildable source under `dir`, sorted.
pub fn sources(dir: &Path) -> Result<Vec<PathBuf>> {
    let dir_str = dir
        .to_str()
        .ok_or_else(|| anyhow!("non-UTF-8 path {}", dir.display()))?;
    // Only the wildcards are ours; the directory is matched literally.
    let root = PathBuf::from(glob::Pattern::escape(dir_str));

    let mut found = vec![];
    for pattern in SOURCE_PATTERNS {
        let pattern = root.join("**").join(pattern);
        let pattern = pattern
            .to_str()
            .ok_or_else(|| anyhow!("non-UTF-8 path {}", dir.display()))?;
        for entry in glob::glob(pattern)? {
            found.push(entry?);
        }
    }
    found.sort();
    found.dedup();
    Ok(found)
}

/// A target needs rebuilding when it is missing or any input was modified
/// after it.
pub fn needs_rebuild(target: &Path, inputs: &[PathBuf]) -> Result<bool> {
    let built = match std::fs::metadata(target) {
        Ok(meta) => FileTime::from_last_modification_time(&meta),
        Err(_) => return Ok(true),
    };
    for input in inputs {
        let meta = std::fs::metadata(input)
            .with_context(|| format!("missing input {}", input.display()))?;
        if FileTime::from_last_modification_time(&meta) > built {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::set_file_mtime;

    fn touch(path: &Path, secs: i64) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"").unwrap();
        set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    #[test]
    fn missing_targets_need_building() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("main.c");
        touch(&src, 1_000);
        assert!(needs_rebuild(&dir.path().join("main.c.o"), &[src]).unwrap());
    }

    #[test]
    fn stale_targets_need_building() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("main.c");
        let obj = dir.path().join("main.c.o");
        touch(&obj, 1_000);
        touch(&src, 2_000);
        assert!(needs_rebuild(&obj, &[src.clone()]).unwrap());

        touch(&obj, 3_000);
        assert!(!needs_rebuild(&obj, &[src]).unwrap());
    }

    #[test]
    fn missing_inputs_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let obj = dir.path().join("main.c.o");
        touch(&obj, 1_000);
        let err =
            needs_rebuild(&obj, &[dir.path().join("gone.c")]).unwrap_err();
        assert!(err.to_string().contains("gone.c"));
    }

    #[test]
    fn sources_are_found_recursively() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "main.c",
            "radio/mac.cpp",
            "radio/phy.cc",
            "boot/vectors.S",
            "boot/crt0.s",
            "README.md",
            "include/app.h",
        ] {
            touch(&dir.path().join(name), 1_000);
        }

        let found: Vec<_> = sources(dir.path())
            .unwrap()
            .into_iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        let expected: Vec<PathBuf> = [
            "boot/crt0.s",
            "boot/vectors.S",
            "main.c",
            "radio/mac.cpp",
            "radio/phy.cc",
        ]
        .iter()
        .map(PathBuf::from)
        .collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn sources_under_a_bracketed_directory() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("fw[v2]").join("src");
        touch(&src.join("main.c"), 1_000);
        touch(&src.join("radio").join("mac.cpp"), 1_000);

        let found = sources(&src).unwrap();
        assert_eq!(found, [src.join("main.c"), src.join("radio/mac.cpp")]);
    }

    #[test]
    fn cxx_objects_are_recognised() {
        for (obj, cxx) in [
            ("obj/src/main.c.o", false),
            ("obj/src/radio/mac.cpp.o", true),
            ("obj/src/radio/phy.cc.o", true),
            ("obj/src/boot/vectors.S.o", false),
            ("obj/src/boot/crt0.s.o", false),
            ("obj/src/noext.o", false),
        ] {
            assert_eq!(is_cxx_object(Path::new(obj)), cxx, "{}", obj);
        }
    }
}
