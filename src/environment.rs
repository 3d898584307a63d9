//! Process environment contracts: bytecode-cache suppression and
//! re-execing the tool in place.

use anyhow::anyhow;
use std::env;
use std::os::unix::process::CommandExt;
use std::process::Command;

/// Environment variable the language runtime recognises as "do not
/// write cached bytecode to disk".
pub const NO_BYTECODE_VAR: &str = "PYTHONDONTWRITEBYTECODE";

/// Make sure the no-bytecode variable is set. If it was absent at
/// startup the process re-executes itself once with the variable in
/// place; on success this never returns.
pub fn ensure_bytecode_suppressed() -> anyhow::Result<()> {
    if env::var_os(NO_BYTECODE_VAR).is_some() {
        return Ok(());
    }
    env::set_var(NO_BYTECODE_VAR, "1");
    Err(restart_in_place())
}

/// Replace this process with a fresh copy of itself, same arguments.
/// Returns only the error when exec fails.
pub fn restart_in_place() -> anyhow::Error {
    let exe = match env::current_exe() {
        Ok(exe) => exe,
        Err(e) => return anyhow!(e).context("cannot locate own executable"),
    };
    let args: Vec<std::ffi::OsString> = env::args_os().skip(1).collect();
    let err = Command::new(exe).args(args).exec();
    anyhow!(err).context("re-exec failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppression_is_a_noop_once_set() {
        // The test harness inherits the variable from CI or a prior
        // re-exec; setting it ourselves makes the check hermetic.
        env::set_var(NO_BYTECODE_VAR, "1");
        assert!(ensure_bytecode_suppressed().is_ok());
    }
}
