use std::path::PathBuf;

use clap::Parser;

/// A single `VM:ROLE` positional target, e.g. `web1:web`.
#[derive(Debug, Clone, PartialEq)]
pub struct VmTarget {
    pub name: String,
    pub role: Option<String>,
}

impl std::str::FromStr for VmTarget {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((name, role)) => Ok(VmTarget { name: name.to_string(), role: Some(role.to_string()) }),
            None => Ok(VmTarget { name: s.to_string(), role: None }),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "vmbuilder", about = "Provision a fleet of libvirt VMs from a cluster definition")]
pub struct Cli {
    /// Path to the cluster definition YAML.
    #[arg(short = 'c', long = "cluster", default_value = "cluster.yaml")]
    pub cluster: PathBuf,

    /// Redefine (and recreate thin LVs for) every target domain before provisioning.
    #[arg(short = 'r', long = "redefine")]
    pub redefine: bool,

    /// Destroy, undefine, and reclaim LVs for every target domain; do not provision.
    #[arg(short = 'd', long = "delete")]
    pub delete: bool,

    /// Concurrent first-boot budget (admission gate). Defaults to the number of targets.
    #[arg(short = 'j', long = "parallel")]
    pub parallel: Option<usize>,

    /// Worker pool size for the provisioning pipeline. Defaults to `max(targets/2, 1)`.
    #[arg(short = 'p', long = "provision-jobs")]
    pub provision_jobs: Option<usize>,

    /// Address the phone-home server listens on.
    #[arg(long = "listen", default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Enable verbose (debug) logging.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// `VM:ROLE` targets; with none given, every host in the cluster is targeted.
    pub targets: Vec<VmTarget>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parses_name_and_role() {
        let t = VmTarget::from_str("web1:web").unwrap();
        assert_eq!(t.name, "web1");
        assert_eq!(t.role.as_deref(), Some("web"));
    }

    #[test]
    fn parses_bare_name() {
        let t = VmTarget::from_str("web1").unwrap();
        assert_eq!(t.name, "web1");
        assert_eq!(t.role, None);
    }
}
