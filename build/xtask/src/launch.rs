// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Starting tools that need the user's terminal to themselves.
//!
//! The JN51xx programmer talks to the user directly and misbehaves when its
//! output is piped, so it must never be run as a captured subprocess. How
//! that is arranged depends on the host, which is why it sits behind
//! [`Launcher`].

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};

pub trait Launcher {
    /// Starts `cmd` interactively and waits for it to exit, failing if it
    /// exits unsuccessfully.
    fn launch(&self, cmd: Command) -> Result<()>;
}

/// Runs the tool in a console window of its own.
#[cfg(windows)]
pub struct NewConsole;

#[cfg(windows)]
impl Launcher for NewConsole {
    fn launch(&self, mut cmd: Command) -> Result<()> {
        use std::os::windows::process::CommandExt;

        const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;

        install_ctrlc_handler()?;
        cmd.creation_flags(CREATE_NEW_CONSOLE);
        log::debug!("{:?}", cmd);
        let _child = ChildRunning::enter();
        let status = cmd
            .status()
            .with_context(|| format!("failed to launch ({:?})", cmd))?;
        if !status.success() {
            bail!("{:?} failed ({}), see its window for details", cmd, status);
        }
        Ok(())
    }
}

/// Hands the tool our own terminal, stdio and all. Hosts without a
/// separate-console concept use this.
#[cfg_attr(windows, allow(dead_code))]
pub struct InheritedTerminal;

impl Launcher for InheritedTerminal {
    fn launch(&self, mut cmd: Command) -> Result<()> {
        if !atty::is(atty::Stream::Stdin) || !atty::is(atty::Stream::Stdout) {
            log::warn!(
                "not attached to a terminal; {:?} may not be able to prompt",
                cmd.get_program()
            );
        }
        install_ctrlc_handler()?;
        log::debug!("{:?}", cmd);
        let _child = ChildRunning::enter();
        let status = cmd
            .status()
            .with_context(|| format!("failed to launch ({:?})", cmd))?;
        if !status.success() {
            bail!("{:?} failed ({}), see output for details", cmd, status);
        }
        Ok(())
    }
}

static CHILD_RUNNING: AtomicBool = AtomicBool::new(false);

/// Marks an interactive tool as running until dropped.
struct ChildRunning;

impl ChildRunning {
    fn enter() -> Self {
        CHILD_RUNNING.store(true, Ordering::SeqCst);
        ChildRunning
    }
}

impl Drop for ChildRunning {
    fn drop(&mut self) {
        CHILD_RUNNING.store(false, Ordering::SeqCst);
    }
}

/// Ctrl-C belongs to the tool while it runs, and we just wait for it to
/// exit. The handler can't be removed again, so once the tool is gone it
/// stops us the way the default action would have.
fn install_ctrlc_handler() -> Result<()> {
    match ctrlc::set_handler(on_ctrlc) {
        Ok(()) | Err(ctrlc::Error::MultipleHandlers) => Ok(()),
        Err(e) => Err(e).context("error setting Ctrl-C handler"),
    }
}

fn on_ctrlc() {
    if !CHILD_RUNNING.load(Ordering::SeqCst) {
        std::process::exit(130);
    }
}

/// Picks the launch strategy this host supports.
pub fn for_host() -> Box<dyn Launcher> {
    #[cfg(windows)]
    {
        Box::new(NewConsole)
    }
    #[cfg(not(windows))]
    {
        Box::new(InheritedTerminal)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::ffi::OsString;
    use std::rc::Rc;

    /// Records what would have been launched instead of running it.
    #[derive(Clone, Default)]
    pub struct Recorder {
        pub launched: Rc<RefCell<Vec<(OsString, Vec<OsString>)>>>,
    }

    impl Launcher for Recorder {
        fn launch(&self, cmd: Command) -> Result<()> {
            self.launched.borrow_mut().push((
                cmd.get_program().to_owned(),
                cmd.get_args().map(|a| a.to_owned()).collect(),
            ));
            Ok(())
        }
    }

    #[test]
    fn recorder_captures_argv() {
        let recorder = Recorder::default();
        let mut cmd = Command::new("JN51xxProgrammer");
        cmd.arg("--verify");
        recorder.launch(cmd).unwrap();
        assert_eq!(
            *recorder.launched.borrow(),
            [(
                OsString::from("JN51xxProgrammer"),
                vec![OsString::from("--verify")]
            )]
        );
    }

    #[test]
    fn ctrlc_is_only_swallowed_while_a_tool_runs() {
        assert!(!CHILD_RUNNING.load(Ordering::SeqCst));
        {
            let _child = ChildRunning::enter();
            assert!(CHILD_RUNNING.load(Ordering::SeqCst));
            // Would exit the test process if the tool weren't running.
            on_ctrlc();
        }
        assert!(!CHILD_RUNNING.load(Ordering::SeqCst));
    }
}
