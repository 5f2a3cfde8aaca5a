//! Router discovery
//!
//! The helper has no configured router address; it finds every router
//! serving its uid by scanning process command lines, and delivery is
//! broadcast to all of them.

use anyhow::Result;
use procfs::process::all_processes;
use regex::Regex;

/// Pids of router processes configured for `uid`.
pub fn find_routers(uid: u32) -> Result<Vec<i32>> {
    let pattern = Regex::new(&format!("trafficrouter .* -uid {uid} .*"))?;

    let mut routers = Vec::new();
    for proc in all_processes()? {
        // processes vanish mid-scan; skip anything unreadable
        let Ok(proc) = proc else { continue };
        let Ok(cmdline) = proc.cmdline() else { continue };
        if cmdline.is_empty() {
            continue;
        }
        if pattern.is_match(&cmdline.join(" ")) {
            routers.push(proc.pid);
        }
    }
    Ok(routers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_not_a_router() {
        let uid = unsafe { libc::getuid() };
        let routers = find_routers(uid).unwrap();
        assert!(!routers.contains(&(std::process::id() as i32)));
    }

    #[test]
    fn test_discovery_pattern_shape() {
        let pattern = Regex::new("trafficrouter .* -uid 1000 .*").unwrap();
        assert!(pattern.is_match(
            "/usr/local/bin/trafficrouter -uid 1000 --require db:5432@eth0:>5432"
        ));
        assert!(!pattern.is_match("/usr/local/bin/trafficrouter -uid 2000 --require db:5432"));
        assert!(!pattern.is_match("trafficrouter -f {}"));
    }
}
