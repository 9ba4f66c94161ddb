//! Cluster YAML loading and validation (A3). Produces the typed
//! `ClusterDef`/`MachineDefaults`/`VmDef` tree that C12 folds into one
//! canonical `VMRecord` per target host.

use std::collections::BTreeMap;
use std::path::Path;

use facet::Facet;

use crate::error::VmBuilderError;

#[derive(Debug, Clone, Facet)]
pub struct ClusterDef {
    pub cluster_name: String,
    pub hosts: BTreeMap<String, Vec<VmDef>>,
    pub machine: MachineDefaults,
    pub source_image: SourceImage,
    #[facet(default = "ubuntu")]
    pub distro: String,
    pub distro_release: String,
    pub admin_password: String,
    #[facet(default)]
    pub net_conf: NetConf,
}

#[derive(Debug, Clone, Facet)]
pub struct VmDef {
    pub name: String,
    #[facet(default)]
    pub cpu_count: Option<u32>,
    #[facet(default)]
    pub base_ram: Option<u64>,
    #[facet(default)]
    pub max_ram: Option<u64>,
    #[facet(default)]
    pub swap_size: Option<u64>,
    #[facet(default)]
    pub swap_label: Option<String>,
    #[facet(default)]
    pub vm_template: Option<String>,
    #[facet(default)]
    pub drives: BTreeMap<String, DriveSpec>,
    #[facet(default)]
    pub interfaces: BTreeMap<String, InterfaceSpec>,
    #[facet(default)]
    pub distro: Option<String>,
    #[facet(default)]
    pub distro_release: Option<String>,
    #[facet(default)]
    pub admin_password: Option<String>,
}

#[derive(Debug, Clone, Facet)]
pub struct MachineDefaults {
    #[facet(default = 1)]
    pub cpu_count: u32,
    #[facet(default = 1024)]
    pub base_ram: u64,
    #[facet(default = 2048)]
    pub max_ram: u64,
    #[facet(default = 2048)]
    pub swap_size: u64,
    #[facet(default = "MOREVM")]
    pub swap_label: String,
    #[facet(default = "vm.xml")]
    pub vm_template: String,
    #[facet(default)]
    pub drives: BTreeMap<String, DriveSpec>,
    #[facet(default)]
    pub interfaces: BTreeMap<String, InterfaceSpec>,
}

/// Either an LV spec (`vg`/`thin_pool`/`disk_size_mb`) or a plain `path` —
/// both fields are optional here and the distinction is enforced at C12
/// merge time, since YAML gives us no tagged-union hint either way.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct DriveSpec {
    #[facet(default)]
    pub vg: Option<String>,
    #[facet(default)]
    pub thin_pool: Option<String>,
    #[facet(default)]
    pub disk_size_mb: Option<u64>,
    #[facet(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Facet)]
pub struct InterfaceSpec {
    pub source_net: String,
    #[facet(default)]
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Facet)]
pub struct SourceImage {
    #[facet(default)]
    pub path: Option<String>,
    #[facet(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct NetConf {
    #[facet(default)]
    pub http_proxy: Option<String>,
    #[facet(default)]
    pub web_callback_url: Option<String>,
}

impl ClusterDef {
    fn validate(&self) -> Result<(), VmBuilderError> {
        if self.cluster_name.is_empty() {
            return Err(VmBuilderError::Validation { message: "cluster_name must not be empty".into() });
        }
        if self.hosts.is_empty() {
            return Err(VmBuilderError::Validation { message: "hosts must declare at least one role".into() });
        }
        match (&self.source_image.path, &self.source_image.url) {
            (Some(_), None) | (None, Some(_)) => {}
            (Some(_), Some(_)) => {
                return Err(VmBuilderError::Validation {
                    message: "source_image must set exactly one of path or url, not both".into(),
                });
            }
            (None, None) => {
                return Err(VmBuilderError::Validation {
                    message: "source_image must set either path or url".into(),
                });
            }
        }
        if !self.machine.drives.contains_key("os") {
            return Err(VmBuilderError::Validation {
                message: "machine.drives must declare an 'os' drive".into(),
            });
        }
        if !self.machine.interfaces.contains_key("default") {
            return Err(VmBuilderError::Validation {
                message: "machine.interfaces must declare a 'default' interface".into(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for vms in self.hosts.values() {
            for vm in vms {
                if vm.name.is_empty() {
                    return Err(VmBuilderError::Validation { message: "every host needs a name".into() });
                }
                if !seen.insert(vm.name.to_ascii_lowercase()) {
                    return Err(VmBuilderError::Validation {
                        message: format!("duplicate host name '{}' across roles", vm.name),
                    });
                }
            }
        }
        Ok(())
    }
}

pub fn load_cluster_def(path: &Path) -> Result<ClusterDef, VmBuilderError> {
    let contents = std::fs::read_to_string(path).map_err(|source| VmBuilderError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let cluster: ClusterDef = facet_yaml::from_str(&contents).map_err(|e| VmBuilderError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    cluster.validate()?;
    Ok(cluster)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClusterDef {
        let mut drives = BTreeMap::new();
        drives.insert("os".to_string(), DriveSpec { vg: Some("vg0".into()), thin_pool: Some("thin".into()), disk_size_mb: Some(20_000), path: None });
        let mut interfaces = BTreeMap::new();
        interfaces.insert("default".to_string(), InterfaceSpec { source_net: "default".into(), mac: None });

        let mut hosts = BTreeMap::new();
        hosts.insert("web".to_string(), vec![VmDef {
            name: "web1".into(),
            cpu_count: None,
            base_ram: None,
            max_ram: None,
            swap_size: None,
            swap_label: None,
            vm_template: None,
            drives: BTreeMap::new(),
            interfaces: BTreeMap::new(),
            distro: None,
            distro_release: None,
            admin_password: None,
        }]);

        ClusterDef {
            cluster_name: "demo".into(),
            hosts,
            machine: MachineDefaults {
                cpu_count: 1,
                base_ram: 1024,
                max_ram: 2048,
                swap_size: 2048,
                swap_label: "MOREVM".into(),
                vm_template: "vm.xml".into(),
                drives,
                interfaces,
            },
            source_image: SourceImage { path: Some("/srv/data/Public/img/ubuntu.raw".into()), url: None },
            distro: "ubuntu".into(),
            distro_release: "jammy".into(),
            admin_password: "changeme".into(),
            net_conf: NetConf::default(),
        }
    }

    #[test]
    fn valid_cluster_passes() {
        sample().validate().unwrap();
    }

    #[test]
    fn rejects_both_path_and_url() {
        let mut def = sample();
        def.source_image.url = Some("http://example.com/img.qcow2".into());
        assert!(def.validate().is_err());
    }

    #[test]
    fn rejects_neither_path_nor_url() {
        let mut def = sample();
        def.source_image.path = None;
        assert!(def.validate().is_err());
    }

    #[test]
    fn rejects_missing_os_drive() {
        let mut def = sample();
        def.machine.drives.clear();
        assert!(def.validate().is_err());
    }

    #[test]
    fn rejects_missing_default_interface() {
        let mut def = sample();
        def.machine.interfaces.clear();
        assert!(def.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_host_names_across_roles() {
        let mut def = sample();
        let vm = def.hosts.get("web").unwrap()[0].clone();
        def.hosts.insert("db".to_string(), vec![vm]);
        assert!(def.validate().is_err());
    }
}
