// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};

use crate::config::{Config, Upload};
use crate::launch::Launcher;

/// Package holding the vendor programmer.
pub const PROGRAMMER_PACKAGE: &str = "tool-nxp-jn51prog";

#[cfg(windows)]
const PROGRAMMER_EXE: &str = "JN51xxProgrammer.exe";
#[cfg(not(windows))]
const PROGRAMMER_EXE: &str = "JN51xxProgrammer";

pub const DEFAULT_UPLOAD_SPEED: u32 = 1_000_000;

/// Port value asking for the port to be found automatically.
pub const AUTO_PORT: &str = "auto";

/// Upload settings given on the command line, which win over the project
/// file.
#[derive(Clone, Debug, Default)]
pub struct UploadArgs {
    pub port: Option<String>,
    pub speed: Option<u32>,
}

/// Baud rate: command line, then `[upload]`, then `[board]`.
pub fn upload_speed(cfg: &Config, args: &UploadArgs) -> u32 {
    args.speed
        .or(cfg.upload.speed)
        .or(cfg.board.upload_speed)
        .unwrap_or(DEFAULT_UPLOAD_SPEED)
}

pub fn programmer_path(cfg: &Config) -> Result<PathBuf> {
    Ok(cfg.package_dir(PROGRAMMER_PACKAGE)?.join(PROGRAMMER_EXE))
}

/// Programmer arguments. Verification is always on; the erase and
/// configuration switches only appear when the project asks for them.
pub fn upload_args(
    opts: &Upload,
    port: &str,
    speed: u32,
    image: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--serial".into(),
        port.into(),
        "--programbaud".into(),
        speed.to_string().into(),
    ];
    if opts.device_config {
        args.push("--deviceconfig".into());
    }
    if opts.force {
        args.push("--force".into());
    }
    if opts.erase_flash {
        args.push("--eraseflash=full".into());
    }
    if opts.erase_eeprom {
        args.push("--eraseeprom=full".into());
    }
    args.push("--verify".into());
    args.push("--loadflash".into());
    args.push(image.into());
    args
}

/// Serial device names to search on this host.
fn default_port_patterns() -> Vec<String> {
    let patterns: &[&str] = if cfg!(target_os = "macos") {
        &["/dev/cu.usbserial*", "/dev/cu.usbmodem*"]
    } else if cfg!(windows) {
        &[]
    } else {
        &["/dev/ttyUSB*", "/dev/ttyACM*"]
    };
    patterns.iter().map(|s| s.to_string()).collect()
}

/// Windows has no device directory to glob, so try opening each COM port.
#[cfg(windows)]
fn probe_com_ports() -> Vec<String> {
    (1..=256)
        .map(|n| format!("COM{}", n))
        .filter(|port| {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(format!(r"\\.\{}", port))
                .is_ok()
        })
        .collect()
}

#[cfg(not(windows))]
fn probe_com_ports() -> Vec<String> {
    vec![]
}

/// Sort key putting `ttyUSB2` before `ttyUSB10`: the name without its
/// trailing digits, then their value.
fn port_order(port: &str) -> (&str, Option<u64>) {
    let stem = port.trim_end_matches(|c: char| c.is_ascii_digit());
    (stem, port[stem.len()..].parse().ok())
}

/// Finds serial devices matching `patterns`, in device number order. With
/// no patterns the host's usual device names are tried.
pub fn find_ports(patterns: &[String]) -> Result<Vec<String>> {
    if patterns.is_empty() {
        let defaults = default_port_patterns();
        if defaults.is_empty() {
            return Ok(probe_com_ports());
        }
        return find_ports(&defaults);
    }

    let mut found = vec![];
    for pattern in patterns {
        for entry in glob::glob(pattern)? {
            let entry = entry?;
            let port = entry
                .to_str()
                .ok_or_else(|| anyhow!("non-UTF-8 port {}", entry.display()))?;
            found.push(port.to_string());
        }
    }
    found.sort_by(|a, b| {
        port_order(a).cmp(&port_order(b)).then_with(|| a.cmp(b))
    });
    found.dedup();
    Ok(found)
}

/// An explicit port is used as given; `auto` (or nothing) means search.
pub fn resolve_port(
    requested: Option<&str>,
    patterns: &[String],
) -> Result<String> {
    match requested {
        Some(port) if port != AUTO_PORT => Ok(port.to_string()),
        _ => {
            log::info!("Looking for upload port...");
            let ports = find_ports(patterns)?;
            match ports.as_slice() {
                [] => bail!(
                    "no device found for upload; connect the board or set \
                     the port with --upload-port"
                ),
                [port] => {
                    log::info!("Auto-detected: {}", port);
                    Ok(port.clone())
                }
                [port, rest @ ..] => {
                    log::warn!(
                        "several serial ports found, using {} (also {:?})",
                        port,
                        rest
                    );
                    Ok(port.clone())
                }
            }
        }
    }
}

/// Resolves the port, then hands the programmer to `launcher`.
pub fn run(
    cfg: &Config,
    args: &UploadArgs,
    image: &Path,
    launcher: &dyn Launcher,
) -> Result<()> {
    let requested = args.port.as_deref().or(cfg.upload.port.as_deref());
    let port = resolve_port(requested, &cfg.upload.port_patterns)?;
    let speed = upload_speed(cfg, args);

    let mut cmd = Command::new(programmer_path(cfg)?);
    cmd.args(upload_args(&cfg.upload, &port, speed, image));

    log::info!("Uploading {}", image.display());
    launcher.launch(cmd).context("upload failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[OsString]) -> Vec<&str> {
        args.iter().map(|a| a.to_str().unwrap()).collect()
    }

    #[test]
    fn explicit_port_gives_the_plain_command_line() {
        let args = upload_args(
            &Upload::default(),
            "COM5",
            1_000_000,
            Path::new("out/firmware.bin"),
        );
        assert_eq!(
            strings(&args),
            [
                "--serial",
                "COM5",
                "--programbaud",
                "1000000",
                "--verify",
                "--loadflash",
                "out/firmware.bin",
            ]
        );
    }

    #[test]
    fn destructive_switches_are_opt_in() {
        let opts = Upload {
            erase_flash: true,
            erase_eeprom: true,
            device_config: true,
            force: true,
            ..Upload::default()
        };
        let args =
            upload_args(&opts, "/dev/ttyUSB0", 38400, Path::new("fw.bin"));
        assert_eq!(
            strings(&args),
            [
                "--serial",
                "/dev/ttyUSB0",
                "--programbaud",
                "38400",
                "--deviceconfig",
                "--force",
                "--eraseflash=full",
                "--eraseeprom=full",
                "--verify",
                "--loadflash",
                "fw.bin",
            ]
        );
    }

    #[test]
    fn explicit_port_skips_detection() {
        let port = resolve_port(Some("COM5"), &["/nonexistent/*".into()]);
        assert_eq!(port.unwrap(), "COM5");
    }

    #[test]
    fn auto_port_with_no_device_fails() {
        let dir = tempfile::tempdir().unwrap();
        let patterns = [format!("{}/ttyUSB*", dir.path().display())];
        for requested in [None, Some(AUTO_PORT)] {
            let err = resolve_port(requested, &patterns).unwrap_err();
            assert!(err.to_string().contains("no device found"), "{}", err);
        }
    }

    #[test]
    fn auto_port_picks_the_first_device() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ttyUSB1", "ttyUSB0", "ttyS0"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let patterns = [format!("{}/ttyUSB*", dir.path().display())];

        let found = find_ports(&patterns).unwrap();
        assert_eq!(found.len(), 2);

        let port = resolve_port(Some(AUTO_PORT), &patterns).unwrap();
        assert!(port.ends_with("ttyUSB0"), "{}", port);
    }

    #[test]
    fn ports_are_ordered_by_device_number() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ttyUSB10", "ttyUSB2", "ttyACM0"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let patterns = [
            format!("{}/ttyUSB*", dir.path().display()),
            format!("{}/ttyACM*", dir.path().display()),
        ];

        let names: Vec<_> = find_ports(&patterns)
            .unwrap()
            .into_iter()
            .map(|p| p.rsplit('/').next().unwrap().to_string())
            .collect();
        assert_eq!(names, ["ttyACM0", "ttyUSB2", "ttyUSB10"]);

        let usb = &patterns[..1];
        let port = resolve_port(None, usb).unwrap();
        assert!(port.ends_with("/ttyUSB2"), "{}", port);
    }
}
