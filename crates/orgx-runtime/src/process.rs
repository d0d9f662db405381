//! Detached child-process supervision (§4.5 "Process supervision
//! primitives", §9 "Detached child supervision is OS-specific"). On POSIX,
//! the child is placed in its own process group at spawn time so it can be
//! signalled as a group even after this process exits; `isPidAlive` /
//! `stopDetachedProcess` are the only portability surface the rest of the
//! dispatch engine needs.

use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::sleep;

const GRACE_PERIOD: Duration = Duration::from_millis(450);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StopOutcome {
    pub stopped: bool,
    #[serde(rename = "wasRunning")]
    pub was_running: bool,
}

/// Spawns `program` with stdio fully ignored, detached into its own
/// process group. No pipes are attached; the caller records only the PID.
pub fn spawn_detached(program: &str, args: &[String]) -> std::io::Result<Child> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
    cmd.spawn()
}

#[cfg(unix)]
pub fn is_pid_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
pub fn is_pid_alive(pid: i32) -> bool {
    use std::process::Command as StdCommand;
    StdCommand::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}")])
        .output()
        .map(|out| {
            String::from_utf8_lossy(&out.stdout).contains(&pid.to_string())
        })
        .unwrap_or(false)
}

#[cfg(unix)]
fn send_signal(pid: i32, group: bool, signal: nix::sys::signal::Signal) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    let target = if group { -pid } else { pid };
    kill(Pid::from_raw(target), Some(signal)).is_ok()
}

#[cfg(unix)]
async fn terminate(pid: i32) {
    use nix::sys::signal::Signal;
    if !send_signal(pid, true, Signal::SIGTERM) {
        send_signal(pid, false, Signal::SIGTERM);
    }
    sleep(GRACE_PERIOD).await;
    if is_pid_alive(pid) {
        if !send_signal(pid, true, Signal::SIGKILL) {
            send_signal(pid, false, Signal::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
async fn terminate(pid: i32) {
    use std::process::Command as StdCommand;
    let _ = StdCommand::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .output();
    sleep(GRACE_PERIOD).await;
    if is_pid_alive(pid) {
        let _ = StdCommand::new("taskkill")
            .args(["/F", "/PID", &pid.to_string(), "/T"])
            .output();
    }
}

/// SIGTERM the process group, wait out the grace period, SIGKILL if still
/// alive. Returns whether the process was running beforehand and whether
/// it is confirmed stopped now.
pub async fn stop_detached_process(pid: i32) -> StopOutcome {
    let was_running = is_pid_alive(pid);
    if !was_running {
        return StopOutcome {
            stopped: false,
            was_running: false,
        };
    }
    terminate(pid).await;
    StopOutcome {
        stopped: !is_pid_alive(pid),
        was_running: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stopping_a_dead_pid_reports_not_running() {
        // PID 1 is always alive on a POSIX test runner (init/systemd), so
        // pick an implausibly large pid that is very unlikely to be alive.
        let outcome = stop_detached_process(i32::MAX - 1).await;
        assert!(!outcome.was_running);
        assert!(!outcome.stopped);
    }

    #[tokio::test]
    async fn spawned_detached_process_can_be_stopped() {
        let child = spawn_detached("sleep", &["5".to_string()]).expect("spawn sleep");
        let pid = child.id().expect("child has a pid") as i32;
        assert!(is_pid_alive(pid));
        let outcome = stop_detached_process(pid).await;
        assert!(outcome.was_running);
        assert!(outcome.stopped);
    }
}
