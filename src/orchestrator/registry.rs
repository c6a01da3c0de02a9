//! Port and IPC/process registries (spec §4.6.2–§4.6.3). Generalizes the
//! teacher's single-dashboard `bind_with_fallback` and single-MCP-session
//! `write_mcp_session_file`/`check_mcp_session` into a multi-service,
//! file-locked registry under the state directory.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::PathBuf;

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub pid: u32,
    pub port: u16,
    pub started_at: i64,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    services: HashMap<String, ServiceEntry>,
}

/// A single on-disk registry, exclusively locked (`fs2::FileExt`, same
/// discipline as the teacher's ledger append) for the duration of each
/// read-modify-write so concurrent orchestrator instances don't race.
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn read_locked(&self) -> Result<(std::fs::File, RegistryFile), Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::from)?;
        }
        let mut file = OpenOptions::new().create(true).read(true).write(true).open(&self.path).map_err(Error::from)?;
        file.lock_exclusive().map_err(|e| Error::Permanent(format!("registry lock: {e}")))?;
        let mut content = String::new();
        file.read_to_string(&mut content).map_err(Error::from)?;
        let parsed = if content.trim().is_empty() {
            RegistryFile::default()
        } else {
            serde_json::from_str(&content).unwrap_or_default()
        };
        Ok((file, parsed))
    }

    fn write_locked(&self, mut file: std::fs::File, data: &RegistryFile) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(data)?;
        file.set_len(0).map_err(Error::from)?;
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(0)).map_err(Error::from)?;
        file.write_all(json.as_bytes()).map_err(Error::from)?;
        file.flush().map_err(Error::from)?;
        FileExt::unlock(&file).ok();
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<ServiceEntry>, Error> {
        let (file, data) = self.read_locked()?;
        let entry = data.services.get(name).cloned();
        FileExt::unlock(&file).ok();
        Ok(entry)
    }

    pub fn all(&self) -> Result<Vec<ServiceEntry>, Error> {
        let (file, data) = self.read_locked()?;
        let entries: Vec<_> = data.services.into_values().collect();
        FileExt::unlock(&file).ok();
        Ok(entries)
    }

    pub fn publish(&self, entry: ServiceEntry) -> Result<(), Error> {
        let (file, mut data) = self.read_locked()?;
        data.services.insert(entry.name.clone(), entry);
        self.write_locked(file, &data)
    }

    pub fn remove(&self, name: &str) -> Result<(), Error> {
        let (file, mut data) = self.read_locked()?;
        data.services.remove(name);
        self.write_locked(file, &data)
    }

    /// Picks a free port starting at `preferred`, consulting both this
    /// registry's recorded ports and the host's actual TCP state so two
    /// orchestrator instances never hand out the same port.
    pub async fn reserve_port(&self, preferred: u16, range: (u16, u16)) -> Result<u16, Error> {
        let taken: std::collections::HashSet<u16> = self.all()?.iter().map(|e| e.port).collect();
        let mut candidate = preferred.max(range.0);
        loop {
            if candidate > range.1 {
                return Err(Error::configuration("no free port in configured range"));
            }
            if !taken.contains(&candidate) && tokio::net::TcpListener::bind(("127.0.0.1", candidate)).await.is_ok() {
                return Ok(candidate);
            }
            candidate += 1;
        }
    }
}

/// Whether `pid` refers to a live process, via the same `kill(pid, 0)`
/// existence probe the teacher's `doctor::count_mcp_servers` uses.
pub fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdoptDecision {
    Adopt,
    RestartStale,
    StartFresh,
}

/// §4.6.3 adoption logic: alive-and-responsive entries are left running,
/// alive-but-unresponsive entries are restarted, absent entries start
/// fresh. "Responsive" is determined by the caller via a health probe;
/// this function only encodes the alive/absent split.
pub fn decide_adoption(existing: Option<&ServiceEntry>, responsive: bool) -> AdoptDecision {
    match existing {
        None => AdoptDecision::StartFresh,
        Some(entry) if !process_alive(entry.pid) => AdoptDecision::StartFresh,
        Some(_) if responsive => AdoptDecision::Adopt,
        Some(_) => AdoptDecision::RestartStale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, port: u16) -> ServiceEntry {
        ServiceEntry { name: name.to_string(), pid: std::process::id(), port, started_at: 0, version: "0.1.0".to_string() }
    }

    #[test]
    fn publish_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().join("registry.json"));
        registry.publish(entry("store", 9000)).unwrap();
        let fetched = registry.get("store").unwrap().unwrap();
        assert_eq!(fetched.port, 9000);
    }

    #[test]
    fn remove_drops_entry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().join("registry.json"));
        registry.publish(entry("store", 9000)).unwrap();
        registry.remove("store").unwrap();
        assert!(registry.get("store").unwrap().is_none());
    }

    #[test]
    fn absent_entry_starts_fresh() {
        assert_eq!(decide_adoption(None, true), AdoptDecision::StartFresh);
    }

    #[test]
    fn dead_pid_starts_fresh_even_if_entry_present() {
        let mut child = std::process::Command::new("true").spawn().expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait for true to exit");

        let mut dead = entry("store", 9000);
        dead.pid = pid;
        assert_eq!(decide_adoption(Some(&dead), true), AdoptDecision::StartFresh);
    }

    #[test]
    fn alive_and_responsive_is_adopted() {
        let mut mine = entry("store", 9000);
        mine.pid = std::process::id();
        assert_eq!(decide_adoption(Some(&mine), true), AdoptDecision::Adopt);
    }

    #[test]
    fn alive_but_unresponsive_is_restarted() {
        let mut mine = entry("store", 9000);
        mine.pid = std::process::id();
        assert_eq!(decide_adoption(Some(&mine), false), AdoptDecision::RestartStale);
    }

    #[tokio::test]
    async fn reserve_port_skips_ports_already_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().join("registry.json"));
        registry.publish(entry("store", 9100)).unwrap();
        let port = registry.reserve_port(9100, (9100, 9110)).await.unwrap();
        assert_ne!(port, 9100);
    }
}
