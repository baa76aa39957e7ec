// src/exec/process_tree.rs

//! Process-tree enumeration and signalling.
//!
//! Descendants are discovered from the OS process table and signalled
//! leaves-first for suspend/terminate (so a dying parent cannot reparent
//! children mid-walk) and root-first for resume. Failure to signal a single
//! pid is logged and skipped; the supervisor's in-memory state is the source
//! of truth, not the signal's ack.

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use sysinfo::System;
use tracing::{debug, warn};

/// Signal-0 existence probe.
pub fn is_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// All descendants of `root` (not including `root` itself), deepest first.
pub fn descendants(root: u32) -> Vec<u32> {
    let sys = System::new_all();
    collect_descendants(&sys, root)
}

fn collect_descendants(sys: &System, root: u32) -> Vec<u32> {
    // parent pid -> children, one pass over the table.
    let mut children: std::collections::HashMap<u32, Vec<u32>> =
        std::collections::HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children
                .entry(parent.as_u32())
                .or_default()
                .push(pid.as_u32());
        }
    }

    // BFS recording depth, then order deepest-first.
    let mut found: Vec<(u32, usize)> = Vec::new();
    let mut frontier: Vec<(u32, usize)> = vec![(root, 0)];
    while let Some((pid, depth)) = frontier.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                found.push((kid, depth + 1));
                frontier.push((kid, depth + 1));
            }
        }
    }

    found.sort_by(|a, b| b.1.cmp(&a.1));
    found.into_iter().map(|(pid, _)| pid).collect()
}

fn send(pid: u32, signal: Signal) {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => debug!(pid, ?signal, "signal sent"),
        Err(err) => warn!(pid, ?signal, error = %err, "failed to signal process"),
    }
}

/// Signal every descendant of `root` (deepest first), then `root` itself.
///
/// The order matters for SIGSTOP/SIGTERM: suspending or killing the root
/// first would let the OS reparent still-running children.
pub fn signal_tree_leaves_first(root: u32, signal: Signal) {
    for pid in descendants(root) {
        send(pid, signal);
    }
    send(root, signal);
}

/// Signal `root` first, then its descendants. Used for SIGCONT so the
/// parent is runnable before its children wake.
pub fn signal_tree_root_first(root: u32, signal: Signal) {
    let mut pids = descendants(root);
    pids.reverse();
    send(root, signal);
    for pid in pids {
        send(pid, signal);
    }
}

/// Terminate an entire process group: SIGTERM, a short grace period, then
/// SIGKILL for anything still alive.
pub async fn terminate_process_group(pgid: u32) {
    let pg = Pid::from_raw(pgid as i32);
    match killpg(pg, Signal::SIGTERM) {
        Ok(()) => debug!(pgid, "SIGTERM sent to process group"),
        Err(err) => {
            warn!(pgid, error = %err, "failed to SIGTERM process group");
            return;
        }
    }

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    if is_alive(pgid) {
        match killpg(pg, Signal::SIGKILL) {
            Ok(()) => debug!(pgid, "SIGKILL sent to process group"),
            Err(err) => warn!(pgid, error = %err, "failed to SIGKILL process group"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn descendants_of_leaf_process_are_empty_or_children() {
        // This test process may spawn helper threads but no child processes.
        let pids = descendants(std::process::id());
        assert!(pids.iter().all(|&p| p != std::process::id()));
    }

    #[test]
    fn deepest_first_ordering() {
        // Synthetic check of the ordering contract via a fabricated table is
        // not possible with sysinfo; assert the property on a real chain
        // instead: spawn sh -c "sleep 5" and expect its child (if the shell
        // forks) to come before the shell itself.
        let mut child = std::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 2 & wait")
            .spawn()
            .expect("spawning sh");
        std::thread::sleep(std::time::Duration::from_millis(300));

        let pids = descendants(child.id());
        // The shell's children (the sleep) must precede the root, which is
        // not part of the list at all.
        assert!(!pids.contains(&child.id()));

        let _ = child.kill();
        let _ = child.wait();
    }
}
