//! Ansible inventory generator (C8). Grows monotonically as guests phone
//! home; every mutation rewrites the whole file atomically.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::VmBuilderError;
use crate::miscutils::atomic_write;

#[derive(Debug, Clone)]
pub struct HostEntry {
    pub ip: String,
    pub windows: bool,
    pub ansible_password: Option<String>,
}

/// Insertion-ordered (per role) map from short hostname to connection
/// parameters, persisted as an INI-style Ansible inventory.
pub struct InventoryGenerator {
    path: PathBuf,
    // role -> (hostname -> entry), hostnames kept in first-seen order.
    roles: BTreeMap<String, Vec<(String, HostEntry)>>,
}

impl InventoryGenerator {
    pub fn new(path: PathBuf) -> Self {
        Self { path, roles: BTreeMap::new() }
    }

    /// Add (or replace) a host's entry under `role`, then rewrite the
    /// inventory file atomically.
    pub async fn add(&mut self, role: &str, name: &str, entry: HostEntry) -> Result<(), VmBuilderError> {
        let bucket = self.roles.entry(role.to_string()).or_default();
        let lower = name.to_ascii_lowercase();
        if let Some(existing) = bucket.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&lower)) {
            existing.1 = entry;
        } else {
            bucket.push((lower, entry));
        }
        self.write().await
    }

    fn render(&self) -> String {
        let mut roles: Vec<&String> = self.roles.keys().collect();
        roles.sort();
        // `all` always leads, regardless of alphabetical position.
        roles.retain(|r| r.as_str() != "all");
        let mut ordered = Vec::with_capacity(roles.len() + 1);
        if self.roles.contains_key("all") {
            ordered.push("all".to_string());
        }
        ordered.extend(roles.into_iter().cloned());

        let mut out = String::new();
        for role in ordered {
            out.push_str(&format!("[{role}]\n"));
            for (name, entry) in &self.roles[&role] {
                out.push_str(&render_host_line(name, entry));
                out.push('\n');
            }
        }
        out
    }

    async fn write(&self) -> Result<(), VmBuilderError> {
        atomic_write(&self.path, &self.render()).await
    }
}

fn render_host_line(name: &str, entry: &HostEntry) -> String {
    if entry.windows {
        let password = entry.ansible_password.as_deref().unwrap_or("");
        format!(
            "{name} ansible_host={ip} ansible_port=5985 ansible_connection=winrm \
             ansible_winrm_scheme=http ansible_winrm_transport=basic \
             ansible_user=administrator ansible_password={password}",
            ip = entry.ip,
        )
    } else {
        format!("{name} ansible_host={ip} ansible_user=root", ip = entry.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unix_entry(ip: &str) -> HostEntry {
        HostEntry { ip: ip.to_string(), windows: false, ansible_password: None }
    }

    #[tokio::test]
    async fn all_role_precedes_other_roles() {
        let dir = tempfile::tempdir().unwrap();
        let mut gen = InventoryGenerator::new(dir.path().join("hosts"));
        gen.add("web", "web1", unix_entry("10.0.0.2")).await.unwrap();
        gen.add("all", "web1", unix_entry("10.0.0.2")).await.unwrap();
        gen.add("db", "db1", unix_entry("10.0.0.3")).await.unwrap();

        let text = tokio::fs::read_to_string(dir.path().join("hosts")).await.unwrap();
        let all_pos = text.find("[all]").unwrap();
        let db_pos = text.find("[db]").unwrap();
        let web_pos = text.find("[web]").unwrap();
        assert!(all_pos < db_pos);
        assert!(all_pos < web_pos);
        assert!(db_pos < web_pos, "remaining roles alphabetized");
    }

    #[tokio::test]
    async fn unix_host_line_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut gen = InventoryGenerator::new(dir.path().join("hosts"));
        gen.add("all", "web1", unix_entry("10.0.0.2")).await.unwrap();
        let text = tokio::fs::read_to_string(dir.path().join("hosts")).await.unwrap();
        assert_eq!(text, "[all]\nweb1 ansible_host=10.0.0.2 ansible_user=root\n");
    }

    #[tokio::test]
    async fn windows_host_line_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut gen = InventoryGenerator::new(dir.path().join("hosts"));
        gen.add(
            "all",
            "win1",
            HostEntry { ip: "10.0.0.5".into(), windows: true, ansible_password: Some("hunter2".into()) },
        )
        .await
        .unwrap();
        let text = tokio::fs::read_to_string(dir.path().join("hosts")).await.unwrap();
        assert!(text.contains("ansible_connection=winrm"));
        assert!(text.contains("ansible_password=hunter2"));
        assert!(text.contains("ansible_user=administrator"));
    }

    #[tokio::test]
    async fn re_adding_a_host_replaces_its_entry_not_duplicates_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut gen = InventoryGenerator::new(dir.path().join("hosts"));
        gen.add("all", "web1", unix_entry("10.0.0.2")).await.unwrap();
        gen.add("all", "web1", unix_entry("10.0.0.9")).await.unwrap();
        let text = tokio::fs::read_to_string(dir.path().join("hosts")).await.unwrap();
        assert_eq!(text.matches("web1").count(), 1);
        assert!(text.contains("10.0.0.9"));
    }
}
