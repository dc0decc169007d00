// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Write;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Result};
use regex::Regex;
use termcolor::{Color, ColorSpec, WriteColor};

use crate::config::Board;
use crate::toolchain::{self, ToolchainProfile};

/// Sections that take up flash.
pub const PROGRAM_SECTIONS: &[&str] = &[
    ".text",
    ".data",
    ".rodata",
    ".version",
    ".bir",
    ".flashheader",
];

/// Sections that take up RAM. `.data` is in both lists: its initializers
/// live in flash and get copied into RAM at startup.
pub const DATA_SECTIONS: &[&str] =
    &[".data", ".bss", ".noinit", ".heap", ".stack"];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Budget {
    Program,
    Data,
}

impl Budget {
    fn label(self) -> &'static str {
        match self {
            Budget::Program => "Flash",
            Budget::Data => "RAM",
        }
    }

    fn noun(self) -> &'static str {
        match self {
            Budget::Program => "program",
            Budget::Data => "data",
        }
    }
}

/// Matches one line of `size -A -d` output against a set of section names,
/// pulling out the size column.
#[derive(Clone, Debug)]
pub struct SizeRule {
    pub budget: Budget,
    pattern: Regex,
}

impl SizeRule {
    pub fn new(budget: Budget, sections: &[&str]) -> Result<Self> {
        let names: Vec<String> =
            sections.iter().map(|s| regex::escape(s)).collect();
        let pattern =
            Regex::new(&format!(r"^(?:{})\s+(\d+).*", names.join("|")))?;
        Ok(SizeRule { budget, pattern })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Size in bytes if `line` describes one of this rule's sections.
    pub fn extract(&self, line: &str) -> Option<u64> {
        self.pattern
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    pub fn matches(&self, section: &str) -> bool {
        self.extract(&format!("{} 0", section)).is_some()
    }
}

/// The two budgets and the rules that fill them.
pub struct SizeRules {
    pub program: SizeRule,
    pub data: SizeRule,
}

impl SizeRules {
    pub fn new() -> Result<Self> {
        Ok(SizeRules {
            program: SizeRule::new(Budget::Program, PROGRAM_SECTIONS)?,
            data: SizeRule::new(Budget::Data, DATA_SECTIONS)?,
        })
    }

    /// Every budget `section` counts towards.
    pub fn classify(&self, section: &str) -> Vec<Budget> {
        [&self.program, &self.data]
            .into_iter()
            .filter(|rule| rule.matches(section))
            .map(|rule| rule.budget)
            .collect()
    }

    fn rule(&self, budget: Budget) -> &SizeRule {
        match budget {
            Budget::Program => &self.program,
            Budget::Data => &self.data,
        }
    }

    /// Totals the sections in the output of `size -A -d`.
    pub fn tally(&self, sysv: &str) -> SizeReport {
        let mut report = SizeReport::default();
        for line in sysv.lines() {
            let section = match line.split_whitespace().next() {
                Some(s) => s,
                None => continue,
            };
            for budget in self.classify(section) {
                let size = self.rule(budget).extract(line).unwrap_or(0);
                match budget {
                    Budget::Program => report.program += size,
                    Budget::Data => report.data += size,
                }
            }
        }
        report
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SizeReport {
    pub program: u64,
    pub data: u64,
}

impl SizeReport {
    pub fn used(&self, budget: Budget) -> u64 {
        match budget {
            Budget::Program => self.program,
            Budget::Data => self.data,
        }
    }
}

/// `size -A -d <elf>`: one line per section, decimal sizes.
pub fn check_command(profile: &ToolchainProfile, elf: &Path) -> Command {
    let mut cmd = Command::new(&profile.tools.size);
    cmd.arg("-A").arg("-d").arg(elf);
    cmd
}

/// `size -B -d <elf>`: the familiar text/data/bss summary.
pub fn print_command(profile: &ToolchainProfile, elf: &Path) -> Command {
    let mut cmd = Command::new(&profile.tools.size);
    cmd.arg("-B").arg("-d").arg(elf);
    cmd
}

/// Measures `elf` and fails if either budget declared by the board is
/// exceeded. Budgets the board leaves out (or sets to zero) are unchecked.
pub fn check(
    profile: &ToolchainProfile,
    board: &Board,
    elf: &Path,
) -> Result<SizeReport> {
    log::info!("Checking size {}", elf.display());
    let sysv = toolchain::output(&mut check_command(profile, elf), "size")?;
    let rules = SizeRules::new()?;
    log::debug!("program sections: {}", rules.program.pattern());
    log::debug!("data sections: {}", rules.data.pattern());
    let report = rules.tally(&sysv);

    let limits = [
        (Budget::Data, board.max_ram_size),
        (Budget::Program, board.max_flash_size),
    ];

    let color_choice = if atty::is(atty::Stream::Stdout) {
        termcolor::ColorChoice::Auto
    } else {
        termcolor::ColorChoice::Never
    };
    let mut out = termcolor::StandardStream::stdout(color_choice);
    for &(budget, max) in &limits {
        if let Some(max) = max.filter(|&m| m > 0) {
            write_usage(&mut out, budget, report.used(budget), max)?;
        }
    }

    for &(budget, max) in &limits {
        if let Some(max) = max.filter(|&m| m > 0) {
            let used = report.used(budget);
            if used > max {
                bail!(
                    "{} size ({} bytes) is greater than maximum allowed ({} bytes)",
                    budget.noun(),
                    used,
                    max
                );
            }
        }
    }

    Ok(report)
}

/// Hands the report from `size -B -d` straight to the user.
pub fn print(profile: &ToolchainProfile, elf: &Path) -> Result<()> {
    log::info!("Calculating size {}", elf.display());
    toolchain::run(&mut print_command(profile, elf), "size")
}

fn write_usage(
    out: &mut impl WriteColor,
    budget: Budget,
    used: u64,
    max: u64,
) -> std::io::Result<()> {
    const BAR_WIDTH: u64 = 10;

    let percent = used as f64 * 100.0 / max as f64;
    let filled = (used.min(max) * BAR_WIDTH / max) as usize;

    write!(out, "{:<6}[", format!("{}:", budget.label()))?;
    let mut color = ColorSpec::new();
    color.set_fg(Some(if percent > 100.0 {
        Color::Red
    } else if percent > 75.0 {
        Color::Yellow
    } else {
        Color::Green
    }));
    out.set_color(&color)?;
    write!(
        out,
        "{}{}",
        "=".repeat(filled),
        " ".repeat(BAR_WIDTH as usize - filled)
    )?;
    out.reset()?;
    writeln!(
        out,
        "] {:>5.1}% (used {} bytes from {} bytes)",
        percent, used, max
    )
}
