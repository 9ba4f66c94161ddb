//! SSH client config generator (C8): a `Host`/`HostName`/`User` block per
//! registered guest, rewritten atomically on every addition.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::VmBuilderError;
use crate::miscutils::atomic_write;

pub struct SshConfigGenerator {
    path: PathBuf,
    // hostname (lowercased) -> (ip, user), insertion order preserved.
    hosts: BTreeMap<String, (String, String)>,
    order: Vec<String>,
}

impl SshConfigGenerator {
    pub fn new(path: PathBuf) -> Self {
        Self { path, hosts: BTreeMap::new(), order: Vec::new() }
    }

    /// Add (or replace) `hostname`'s entry, then rewrite the config
    /// atomically. `user` defaults to `root` for unix guests and
    /// `administrator` for Windows ones; callers decide which to pass.
    pub async fn add(&mut self, hostname: &str, ip: &str, user: &str) -> Result<(), VmBuilderError> {
        let key = hostname.to_ascii_lowercase();
        if !self.hosts.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.hosts.insert(key, (ip.to_string(), user.to_string()));
        self.write().await
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for name in &self.order {
            let (ip, user) = &self.hosts[name];
            out.push_str(&format!("Host {name}\n  HostName {ip}\n  User {user}\n"));
        }
        out
    }

    async fn write(&self) -> Result<(), VmBuilderError> {
        atomic_write(&self.path, &self.render()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn renders_host_hostname_user_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut gen = SshConfigGenerator::new(dir.path().join("ssh_config"));
        gen.add("web1", "10.0.0.2", "root").await.unwrap();
        let text = tokio::fs::read_to_string(dir.path().join("ssh_config")).await.unwrap();
        assert_eq!(text, "Host web1\n  HostName 10.0.0.2\n  User root\n");
    }

    #[tokio::test]
    async fn preserves_insertion_order_across_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let mut gen = SshConfigGenerator::new(dir.path().join("ssh_config"));
        gen.add("zeta", "10.0.0.9", "root").await.unwrap();
        gen.add("alpha", "10.0.0.2", "root").await.unwrap();
        let text = tokio::fs::read_to_string(dir.path().join("ssh_config")).await.unwrap();
        assert!(text.find("Host zeta").unwrap() < text.find("Host alpha").unwrap());
    }

    #[tokio::test]
    async fn re_adding_replaces_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut gen = SshConfigGenerator::new(dir.path().join("ssh_config"));
        gen.add("web1", "10.0.0.2", "root").await.unwrap();
        gen.add("web1", "10.0.0.9", "root").await.unwrap();
        let text = tokio::fs::read_to_string(dir.path().join("ssh_config")).await.unwrap();
        assert_eq!(text.matches("Host web1").count(), 1);
        assert!(text.contains("10.0.0.9"));
    }
}
