use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::info;

use crate::error::EngineError;

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Rewrites `hosts_path` so it contains exactly one `<ip> <name>` line for
/// `name`, leaving every other line untouched. Guarded by an advisory lock
/// on `lock_path` with a 10s acquisition timeout; on timeout the caller
/// should log and move on — the next sweep retries the publish.
pub fn publish_host_entry(
    hosts_path: &Path,
    lock_path: &Path,
    ip: &str,
    name: &str,
) -> Result<(), EngineError> {
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(lock_path)
        .map_err(|e| EngineError::HostsIo(e.to_string()))?;

    let deadline = Instant::now() + LOCK_TIMEOUT;
    loop {
        if lock_file.try_lock_exclusive().is_ok() {
            break;
        }
        if Instant::now() >= deadline {
            return Err(EngineError::LockTimeout(lock_path.display().to_string()));
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    let result = rewrite_hosts(hosts_path, ip, name);
    let _ = FileExt::unlock(&lock_file);
    result
}

fn rewrite_hosts(hosts_path: &Path, ip: &str, name: &str) -> Result<(), EngineError> {
    let existing = std::fs::read_to_string(hosts_path).unwrap_or_default();
    let mut lines: Vec<String> = existing
        .lines()
        .filter(|line| line.split_whitespace().nth(1) != Some(name))
        .map(str::to_string)
        .collect();
    lines.push(format!("{ip} {name}"));

    let mut file = File::create(hosts_path).map_err(|e| EngineError::HostsIo(e.to_string()))?;
    for line in &lines {
        writeln!(file, "{line}").map_err(|e| EngineError::HostsIo(e.to_string()))?;
    }
    info!(name, ip, "published hosts entry");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn replaces_existing_entry_for_same_name() {
        let dir = tempdir().unwrap();
        let hosts = dir.path().join("hosts");
        let lock = dir.path().join("hosts.lock");
        std::fs::write(&hosts, "127.0.0.1 localhost\n10.0.0.1 p1-ng1-1\n").unwrap();

        publish_host_entry(&hosts, &lock, "10.0.0.9", "p1-ng1-1").unwrap();

        let contents = std::fs::read_to_string(&hosts).unwrap();
        assert!(contents.contains("127.0.0.1 localhost"));
        assert!(contents.contains("10.0.0.9 p1-ng1-1"));
        assert!(!contents.contains("10.0.0.1 p1-ng1-1"));
    }

    #[test]
    fn creates_file_when_absent() {
        let dir = tempdir().unwrap();
        let hosts = dir.path().join("hosts");
        let lock = dir.path().join("hosts.lock");

        publish_host_entry(&hosts, &lock, "10.0.0.2", "p1-ng1-2").unwrap();
        let contents = std::fs::read_to_string(&hosts).unwrap();
        assert_eq!(contents.trim(), "10.0.0.2 p1-ng1-2");
    }
}
