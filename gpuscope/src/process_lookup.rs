//! Process metadata lookup from `/proc`. Enrichment only: every function is
//! best-effort and a miss (the process already exited, permission denied)
//! simply yields `None`.

use std::fs;

/// Command name from `/proc/<pid>/comm`, without the trailing newline.
#[must_use]
pub fn comm(pid: i32) -> Option<String> {
    let raw = fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
    Some(raw.trim_end_matches('\n').to_string())
}

/// Command line from `/proc/<pid>/cmdline`, NUL separators replaced with
/// spaces the way the original agent rendered it.
#[must_use]
pub fn cmdline(pid: i32) -> Option<String> {
    let raw = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if raw.is_empty() {
        return None;
    }
    let joined: Vec<String> = raw
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    Some(joined.join(" "))
}

/// Parent pid from `/proc/<pid>/status`.
#[must_use]
pub fn ppid(pid: i32) -> Option<i32> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("PPid:") {
            return rest.trim().parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::cast_possible_wrap)]
    fn self_pid() -> i32 {
        std::process::id() as i32
    }

    #[test]
    fn comm_of_the_current_process_is_non_empty() {
        let comm = comm(self_pid()).unwrap();
        assert!(!comm.is_empty());
        assert!(!comm.ends_with('\n'));
    }

    #[test]
    fn cmdline_of_the_current_process_is_space_joined() {
        let cmdline = cmdline(self_pid()).unwrap();
        assert!(!cmdline.is_empty());
        assert!(!cmdline.contains('\0'));
    }

    #[test]
    fn ppid_of_the_current_process_exists() {
        assert!(ppid(self_pid()).unwrap() > 0);
    }

    #[test]
    fn missing_processes_yield_none() {
        assert_eq!(comm(-1), None);
        assert_eq!(cmdline(-1), None);
        assert_eq!(ppid(-1), None);
    }
}
