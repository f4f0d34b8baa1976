//! Process information for members of the exclusion cgroup.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

/// Launcher invocations stripped from displayed command lines.
const LAUNCHER_PREFIXES: [&str; 4] = [
    "/usr/bin/ivpn exclude ",
    "/usr/bin/ivpn splittun -execute ",
    "ivpn exclude ",
    "ivpn splittun -execute ",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningApp {
    pub pid: u32,
    pub ppid: u32,
    pub pgrp: u32,
    pub session: u32,
    pub cmdline: String,
    pub exe: String,
    /// The explicitly added ancestor this process descends from.
    pub root_pid: Option<u32>,
    /// Command line without the launcher prefix, or the command that was
    /// registered for an explicitly added process.
    pub modified_cmdline: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatFields {
    pub ppid: u32,
    pub pgrp: u32,
    pub session: u32,
}

/// Parse `/proc/<pid>/stat`.
///
/// The second field is the command name in parentheses and may itself
/// contain spaces and parentheses, so fields are counted from the last `)`.
pub fn parse_stat(text: &str) -> Option<StatFields> {
    let rest = &text[text.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace().skip(1);
    Some(StatFields {
        ppid: fields.next()?.parse().ok()?,
        pgrp: fields.next()?.parse().ok()?,
        session: fields.next()?.parse().ok()?,
    })
}

/// `/proc/<pid>/cmdline` with NUL separators turned into spaces.
pub fn clean_cmdline(raw: &[u8]) -> String {
    let text: String = String::from_utf8_lossy(raw)
        .chars()
        .map(|c| if c == '\0' { ' ' } else { c })
        .collect();
    text.trim().to_string()
}

pub fn strip_launcher(cmdline: &str) -> String {
    let mut out = format!("{} ", cmdline);
    for prefix in LAUNCHER_PREFIXES {
        if let Some(stripped) = out.strip_prefix(prefix) {
            out = stripped.to_string();
        }
    }
    out.trim().to_string()
}

/// PIDs listed in a `cgroup.procs` file.
pub fn parse_pid_list(text: &str) -> Vec<u32> {
    text.lines()
        .filter_map(|l| {
            let l = l.trim();
            if l.is_empty() {
                return None;
            }
            match l.parse() {
                Ok(pid) => Some(pid),
                Err(_) => {
                    log::warn!("Ignoring malformed PID {:?}", l);
                    None
                }
            }
        })
        .collect()
}

/// Read one process from a procfs mount. Processes that vanished meanwhile
/// yield `None`.
pub fn read_process(proc_root: &Path, pid: u32) -> Option<RunningApp> {
    let dir = proc_root.join(pid.to_string());
    let cmdline = match fs::read(dir.join("cmdline")) {
        Ok(raw) => clean_cmdline(&raw),
        Err(e) => {
            log::debug!("Process {} gone: {}", pid, e);
            return None;
        }
    };
    let stat = match fs::read_to_string(dir.join("stat")) {
        Ok(text) => parse_stat(&text).unwrap_or_default(),
        Err(e) => {
            log::warn!("Unable to read stat of {}: {}", pid, e);
            StatFields::default()
        }
    };
    let exe = fs::read_link(dir.join("exe"))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    Some(RunningApp {
        pid,
        ppid: stat.ppid,
        pgrp: stat.pgrp,
        session: stat.session,
        modified_cmdline: strip_launcher(&cmdline),
        cmdline,
        exe,
        root_pid: None,
    })
}

/// Attach root information to `apps` and forget roots that have exited.
pub fn resolve_roots(apps: &mut [RunningApp], roots: &mut BTreeMap<u32, String>) {
    let by_pid: HashMap<u32, u32> = apps.iter().map(|a| (a.pid, a.ppid)).collect();
    roots.retain(|pid, _| by_pid.contains_key(pid));

    for app in apps.iter_mut() {
        if let Some(command) = roots.get(&app.pid) {
            app.root_pid = Some(app.pid);
            app.modified_cmdline = command.clone();
            continue;
        }
        let mut current = app.ppid;
        app.root_pid = loop {
            if roots.contains_key(&current) {
                break Some(current);
            }
            match by_pid.get(&current) {
                // Parents always have a lower PID unless the counter wrapped.
                Some(&parent) if parent < current => current = parent,
                _ => break None,
            }
        };
    }
}

/// `pid` and every process below it.
pub fn descendants(apps: &[RunningApp], pid: u32) -> Vec<u32> {
    let mut found = vec![pid];
    loop {
        let before = found.len();
        for app in apps {
            if found.contains(&app.ppid) && !found.contains(&app.pid) {
                found.push(app.pid);
            }
        }
        if found.len() == before {
            return found;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_process(root: &Path, pid: u32, ppid: u32, comm: &str, cmdline: &[u8]) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("stat"),
            format!("{} ({}) S {} {} {} 0 -1 4194560 1\n", pid, comm, ppid, ppid, ppid),
        )
        .unwrap();
        fs::write(dir.join("cmdline"), cmdline).unwrap();
    }

    #[test]
    fn test_parse_stat_with_tricky_comm() {
        let stat = parse_stat("4242 (Web Content (x)) S 4100 4000 3900 0 -1").unwrap();
        assert_eq!(
            stat,
            StatFields {
                ppid: 4100,
                pgrp: 4000,
                session: 3900
            }
        );
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn test_strip_launcher() {
        assert_eq!(strip_launcher("/usr/bin/ivpn exclude firefox"), "firefox");
        assert_eq!(strip_launcher("ivpn splittun -execute curl -s x"), "curl -s x");
        assert_eq!(strip_launcher("/usr/bin/curl"), "/usr/bin/curl");
    }

    #[test]
    fn test_read_process_from_procfs() {
        let dir = tempfile::tempdir().unwrap();
        fake_process(dir.path(), 700, 1, "curl", b"/usr/bin/ivpn\0exclude\0curl\0-s\0");
        let app = read_process(dir.path(), 700).unwrap();
        assert_eq!(app.ppid, 1);
        assert_eq!(app.cmdline, "/usr/bin/ivpn exclude curl -s");
        assert_eq!(app.modified_cmdline, "curl -s");
        assert!(read_process(dir.path(), 701).is_none());
    }

    #[test]
    fn test_resolve_roots_walks_ancestors_and_prunes() {
        let app = |pid, ppid| RunningApp {
            pid,
            ppid,
            pgrp: 0,
            session: 0,
            cmdline: String::new(),
            exe: String::new(),
            root_pid: None,
            modified_cmdline: String::new(),
        };
        let mut apps = vec![app(100, 1), app(110, 100), app(120, 110), app(300, 1)];
        let mut roots = BTreeMap::from([(100, "firefox".to_string()), (999, "gone".to_string())]);
        resolve_roots(&mut apps, &mut roots);

        assert_eq!(roots.len(), 1);
        assert_eq!(apps[0].root_pid, Some(100));
        assert_eq!(apps[0].modified_cmdline, "firefox");
        assert_eq!(apps[2].root_pid, Some(100));
        assert_eq!(apps[3].root_pid, None);
        assert_eq!(descendants(&apps, 100), vec![100, 110, 120]);
    }

    #[test]
    fn test_parse_pid_list() {
        assert_eq!(parse_pid_list("12\n\n34\nabc\n"), vec![12, 34]);
    }
}
