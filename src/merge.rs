//! VM definition merger (C12): fold cluster machine defaults and per-VM
//! overrides into one canonical `VmRecord`, the only thing downstream
//! components (C5-C10) ever see.

use std::collections::BTreeMap;
use std::path::Path;

use uuid::Uuid;

use crate::config::{ClusterDef, DriveSpec, InterfaceSpec, VmDef};
use crate::error::VmBuilderError;
use crate::image_cloner::is_windows_distro;
use crate::libvirt;

const DEFAULT_WEB_CALLBACK_URL: &str = "http://{hypervisor_ip}:8080";

#[derive(Debug, Clone, PartialEq)]
pub enum DriveResolved {
    Lv { vg: String, thin_pool: String, disk_size_mib: u64 },
    Path(String),
}

#[derive(Debug, Clone)]
pub struct VmResources {
    pub cpu_count: u32,
    pub base_ram_mib: u64,
    pub max_ram_mib: u64,
    pub swap_size_mib: u64,
    pub swap_label: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedInterface {
    pub source_net: String,
    pub mac: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NetworkEnv {
    pub hypervisor_ip: String,
    pub http_proxy: Option<String>,
    pub web_callback_url: String,
    pub ssh_authorized_keys: Vec<String>,
    pub whoami: String,
}

#[derive(Debug, Clone)]
pub struct VmRecord {
    pub name: String,
    pub role: String,
    pub instance_id: Uuid,
    pub distro: String,
    pub distro_release: String,
    pub admin_password: String,
    pub resources: VmResources,
    pub drives: BTreeMap<String, DriveResolved>,
    pub interfaces: Vec<(String, ResolvedInterface)>,
    pub network_env: NetworkEnv,
    pub vm_template: String,
    pub ansible_password: Option<String>,
}

fn resolve_drive_spec(name: &str, spec: &DriveSpec) -> Result<DriveResolved, VmBuilderError> {
    match (&spec.path, &spec.vg, &spec.thin_pool, &spec.disk_size_mb) {
        (Some(path), None, None, None) => Ok(DriveResolved::Path(path.clone())),
        (None, Some(vg), Some(thin_pool), Some(size)) => {
            Ok(DriveResolved::Lv { vg: vg.clone(), thin_pool: thin_pool.clone(), disk_size_mib: *size })
        }
        _ => Err(VmBuilderError::Validation {
            message: format!("drive '{name}' must be either a bare path or a complete vg/thin_pool/disk_size_mb spec"),
        }),
    }
}

fn merge_drives(
    base: &BTreeMap<String, DriveSpec>,
    overrides: &BTreeMap<String, DriveSpec>,
    install_image: &str,
) -> Result<BTreeMap<String, DriveResolved>, VmBuilderError> {
    let mut merged = base.clone();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    let mut resolved: BTreeMap<String, DriveResolved> =
        merged.iter().map(|(k, v)| Ok((k.clone(), resolve_drive_spec(k, v)?))).collect::<Result<_, VmBuilderError>>()?;
    resolved.insert("install_image".to_string(), DriveResolved::Path(install_image.to_string()));
    Ok(resolved)
}

fn merge_interfaces(
    base: &BTreeMap<String, InterfaceSpec>,
    overrides: &BTreeMap<String, InterfaceSpec>,
) -> Vec<(String, ResolvedInterface)> {
    let mut merged = base.clone();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged.into_iter().map(|(k, v)| (k, ResolvedInterface { source_net: v.source_net, mac: v.mac })).collect()
}

/// Lines of `~/.ssh/authorized_keys` (or `path`, if given) that aren't
/// comments, trimmed of trailing newlines.
pub async fn read_authorized_keys(path: Option<&Path>) -> Result<Vec<String>, VmBuilderError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => dirs::home_dir().unwrap_or_else(|| Path::new("/root").to_path_buf()).join(".ssh/authorized_keys"),
    };
    let contents = tokio::fs::read_to_string(&path).await.map_err(|e| VmBuilderError::Io {
        context: format!("reading {}", path.display()),
        source: e,
    })?;
    Ok(contents.lines().filter(|l| !l.starts_with('#')).map(str::to_string).collect())
}

fn substitute_hypervisor_ip(template: &str, hypervisor_ip: &str) -> String {
    template.replace("{hypervisor_ip}", hypervisor_ip)
}

/// Fold `cluster`'s machine defaults and `vm`'s per-host overrides into a
/// canonical VmRecord. `install_image` is the already-resolved local raw
/// image path; `libvirt_conn` is the libvirt connection URI used to look
/// up the bridge IP of the `default` interface's source network.
pub async fn merge_vm_info(
    cluster: &ClusterDef,
    vm: &VmDef,
    role: &str,
    install_image: &str,
    libvirt_conn: &str,
) -> Result<VmRecord, VmBuilderError> {
    let resources = VmResources {
        cpu_count: vm.cpu_count.unwrap_or(cluster.machine.cpu_count),
        base_ram_mib: vm.base_ram.unwrap_or(cluster.machine.base_ram),
        max_ram_mib: vm.max_ram.unwrap_or(cluster.machine.max_ram),
        swap_size_mib: vm.swap_size.unwrap_or(cluster.machine.swap_size),
        swap_label: vm.swap_label.clone().unwrap_or_else(|| cluster.machine.swap_label.clone()),
    };
    let vm_template = vm.vm_template.clone().unwrap_or_else(|| cluster.machine.vm_template.clone());

    let distro = vm.distro.clone().unwrap_or_else(|| cluster.distro.clone());
    let distro_release = vm.distro_release.clone().unwrap_or_else(|| cluster.distro_release.clone());
    let admin_password = vm.admin_password.clone().unwrap_or_else(|| cluster.admin_password.clone());

    let drives = merge_drives(&cluster.machine.drives, &vm.drives, install_image)?;
    let interfaces = merge_interfaces(&cluster.machine.interfaces, &vm.interfaces);

    let default_source_net = interfaces
        .iter()
        .find(|(name, _)| name == "default")
        .map(|(_, iface)| iface.source_net.clone())
        .ok_or_else(|| VmBuilderError::Validation { message: "no 'default' interface after merge".into() })?;

    let hypervisor_ip = libvirt::net_host_ip(&default_source_net, libvirt_conn)
        .await?
        .ok_or_else(|| VmBuilderError::NetworkNotFound { name: default_source_net.clone() })?;

    let http_proxy = cluster.net_conf.http_proxy.as_deref().map(|tpl| substitute_hypervisor_ip(tpl, &hypervisor_ip));
    let web_callback_tpl = cluster.net_conf.web_callback_url.as_deref().unwrap_or(DEFAULT_WEB_CALLBACK_URL);
    let web_callback_url = substitute_hypervisor_ip(web_callback_tpl, &hypervisor_ip);

    let ssh_authorized_keys = read_authorized_keys(None).await?;
    let whoami = std::env::var("USER").unwrap_or_else(|_| "root".to_string());

    let ansible_password = if is_windows_distro(&distro) {
        let pw = admin_password.clone();
        if pw.is_empty() {
            return Err(VmBuilderError::MissingAnsiblePassword { name: vm.name.clone() });
        }
        Some(pw)
    } else {
        None
    };

    Ok(VmRecord {
        name: vm.name.clone(),
        role: role.to_string(),
        instance_id: Uuid::new_v4(),
        distro,
        distro_release,
        admin_password,
        resources,
        drives,
        interfaces,
        network_env: NetworkEnv { hypervisor_ip, http_proxy, web_callback_url, ssh_authorized_keys, whoami },
        vm_template,
        ansible_password,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(path: Option<&str>, vg: Option<&str>, thin_pool: Option<&str>, size: Option<u64>) -> DriveSpec {
        DriveSpec {
            path: path.map(str::to_string),
            vg: vg.map(str::to_string),
            thin_pool: thin_pool.map(str::to_string),
            disk_size_mb: size,
        }
    }

    #[test]
    fn resolves_bare_path_drive() {
        let resolved = resolve_drive_spec("journal", &spec(Some("/dev/vg/journal"), None, None, None)).unwrap();
        assert_eq!(resolved, DriveResolved::Path("/dev/vg/journal".into()));
    }

    #[test]
    fn resolves_lv_spec_drive() {
        let resolved = resolve_drive_spec("os", &spec(None, Some("vg0"), Some("thin0"), Some(20_000))).unwrap();
        assert_eq!(resolved, DriveResolved::Lv { vg: "vg0".into(), thin_pool: "thin0".into(), disk_size_mib: 20_000 });
    }

    #[test]
    fn rejects_partial_lv_spec() {
        assert!(resolve_drive_spec("os", &spec(None, Some("vg0"), None, Some(20_000))).is_err());
    }

    #[test]
    fn rejects_empty_drive_spec() {
        assert!(resolve_drive_spec("os", &spec(None, None, None, None)).is_err());
    }

    #[test]
    fn merge_drives_overrides_base_and_injects_install_image() {
        let mut base = BTreeMap::new();
        base.insert("os".to_string(), spec(None, Some("vg0"), Some("thin0"), Some(20_000)));
        let mut overrides = BTreeMap::new();
        overrides.insert("os".to_string(), spec(None, Some("vg1"), Some("thin1"), Some(30_000)));

        let merged = merge_drives(&base, &overrides, "/srv/img/ubuntu.raw").unwrap();
        assert_eq!(merged["os"], DriveResolved::Lv { vg: "vg1".into(), thin_pool: "thin1".into(), disk_size_mib: 30_000 });
        assert_eq!(merged["install_image"], DriveResolved::Path("/srv/img/ubuntu.raw".into()));
    }

    #[test]
    fn merge_interfaces_overrides_by_name() {
        let mut base = BTreeMap::new();
        base.insert("default".to_string(), InterfaceSpec { source_net: "default".into(), mac: None });
        let mut overrides = BTreeMap::new();
        overrides.insert("default".to_string(), InterfaceSpec { source_net: "storage".into(), mac: Some("aa:bb:cc:dd:ee:ff".into()) });

        let merged = merge_interfaces(&base, &overrides);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].1.source_net, "storage");
        assert_eq!(merged[0].1.mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
    }

    #[test]
    fn substitutes_hypervisor_ip_placeholder() {
        assert_eq!(
            substitute_hypervisor_ip("http://{hypervisor_ip}:8080", "192.168.122.1"),
            "http://192.168.122.1:8080"
        );
    }
}
