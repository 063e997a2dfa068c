use std::ffi::OsStr;
use std::process::Command;

/// Builds a `Command` suitable for running background tools without
/// surfacing a console window on Windows.
pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}
