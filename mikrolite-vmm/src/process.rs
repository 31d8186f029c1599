//! Process spawn and signal helpers shared by both providers (§4.5).
//!
//! Tracks a raw PID, signals it, and tolerates it already being gone,
//! the same shape as supervising a forked child process, adapted to
//! spawning a hypervisor binary with `tokio::process::Command` instead.

use std::process::Stdio;

use mikrolite::StateStore;

/// Spawns `binary` with `args`, redirecting stdout/stderr to the paths the
/// state store names for `vm_name`. Returns its PID; the child is left to
/// run detached; dropping the `Child` handle does not kill it.
pub async fn spawn_detached(
    state: &StateStore,
    vm_name: &str,
    binary: &str,
    args: &[String],
) -> std::io::Result<u32> {
    let stdout = std::fs::File::create(state.stdout_path(vm_name))?;
    let stderr = std::fs::File::create(state.stderr_path(vm_name))?;

    let child = tokio::process::Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()?;

    child
        .id()
        .ok_or_else(|| std::io::Error::other("spawned process exited before its pid could be read"))
}

/// Sends signal `sig` to `pid`. Treats `pid == 0` ("never started") and
/// `ESRCH` ("already gone") as success rather than errors.
pub fn signal(pid: u32, sig: i32) -> std::io::Result<()> {
    if pid == 0 {
        return Ok(());
    }

    // SAFETY: `kill` only reads its arguments; sending a signal to a pid
    // this process doesn't own just fails with `EPERM`/`ESRCH`.
    let ret = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if ret == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}
