//! Domain XML and cloud-init/Autounattend content rendering.
//!
//! The specification treats templating as someone else's job — C11 only
//! needs *some* well-formed XML to hand to `virsh define` and *some*
//! bytes to burn onto a config drive. This module is that stand-in: a
//! minimal, direct renderer rather than a templating engine, grounded in
//! the same facet-xml struct style [`crate::libvirt`] uses to parse the
//! XML libvirt hands back.

use std::collections::BTreeMap;

use facet::Facet;

use crate::error::VmBuilderError;
use crate::merge::{DriveResolved, VmRecord};

#[derive(Debug, Facet)]
struct Empty {}

#[derive(Debug, Facet)]
#[facet(rename = "domain")]
struct DomainXml {
    #[facet(xml::attribute, rename = "type")]
    domain_type: String,
    name: String,
    uuid: String,
    memory: MemoryXml,
    #[facet(rename = "currentMemory")]
    current_memory: MemoryXml,
    vcpu: u32,
    os: OsXml,
    features: FeaturesXml,
    devices: DevicesXml,
}

#[derive(Debug, Facet)]
struct MemoryXml {
    #[facet(xml::attribute)]
    unit: String,
    #[facet(xml::text)]
    value: u64,
}

#[derive(Debug, Facet)]
struct OsXml {
    #[facet(rename = "type")]
    os_type: OsTypeXml,
    boot: BootXml,
}

#[derive(Debug, Facet)]
#[facet(rename = "type")]
struct OsTypeXml {
    #[facet(xml::attribute)]
    arch: String,
    #[facet(xml::text)]
    value: String,
}

#[derive(Debug, Facet)]
struct BootXml {
    #[facet(xml::attribute)]
    dev: String,
}

#[derive(Debug, Facet)]
struct FeaturesXml {
    acpi: Empty,
    apic: Empty,
}

#[derive(Debug, Facet)]
struct DevicesXml {
    #[facet(rename = "disk", default)]
    disks: Vec<DiskXml>,
    #[facet(rename = "interface", default)]
    interfaces: Vec<InterfaceXml>,
}

#[derive(Debug, Facet)]
struct DiskXml {
    #[facet(xml::attribute, rename = "type")]
    disk_type: String,
    #[facet(xml::attribute)]
    device: String,
    driver: DiskDriverXml,
    source: DiskSourceXml,
    target: DiskTargetXml,
}

#[derive(Debug, Facet)]
struct DiskDriverXml {
    #[facet(xml::attribute)]
    name: String,
    #[facet(xml::attribute, rename = "type")]
    driver_type: String,
}

#[derive(Debug, Facet)]
struct DiskSourceXml {
    #[facet(xml::attribute, rename = "dev")]
    dev: Option<String>,
    #[facet(xml::attribute, rename = "file")]
    file: Option<String>,
}

#[derive(Debug, Facet)]
struct DiskTargetXml {
    #[facet(xml::attribute)]
    dev: String,
    #[facet(xml::attribute)]
    bus: String,
}

#[derive(Debug, Facet)]
struct InterfaceXml {
    #[facet(xml::attribute, rename = "type")]
    iface_type: String,
    mac: MacXml,
    source: InterfaceSourceXml,
    model: InterfaceModelXml,
}

#[derive(Debug, Facet)]
struct MacXml {
    #[facet(xml::attribute)]
    address: String,
}

#[derive(Debug, Facet)]
struct InterfaceSourceXml {
    #[facet(xml::attribute)]
    network: String,
}

#[derive(Debug, Facet)]
struct InterfaceModelXml {
    #[facet(xml::attribute, rename = "type")]
    model_type: String,
}

fn virtio_letters() -> impl Iterator<Item = String> {
    (b'a'..=b'z').map(|c| format!("vd{}", c as char))
}

/// Every drive role except `install_image`, in a fixed order: `os` first,
/// then the rest alphabetically. `install_image` is the raw clone source
/// (C6's input), never an attached domain disk.
fn ordered_disk_roles(drives: &BTreeMap<String, DriveResolved>) -> Vec<&String> {
    let mut roles: Vec<&String> = drives.keys().filter(|r| r.as_str() != "install_image").collect();
    roles.sort_by_key(|r| (r.as_str() != "os", r.as_str()));
    roles
}

/// Render a domain's XML definition. `drive_devices` maps each role to the
/// concrete device/file path to attach (a `/dev/mapper/...` node for an LV
/// drive, or the bare path for a `Path` drive); `config_drive_path`, if
/// given, is attached as a cdrom.
pub fn render_domain_xml(
    vm: &VmRecord,
    drive_devices: &BTreeMap<String, String>,
    config_drive_path: Option<&str>,
) -> Result<String, VmBuilderError> {
    let mut devs = virtio_letters();
    let mut disks = Vec::new();
    for role in ordered_disk_roles(&vm.drives) {
        let Some(path) = drive_devices.get(role) else { continue };
        let dev = devs.next().ok_or_else(|| VmBuilderError::Validation {
            message: format!("VM '{}' has more drives than virtio device letters available", vm.name),
        })?;
        let is_lv = matches!(vm.drives[role], DriveResolved::Lv { .. });
        disks.push(DiskXml {
            disk_type: "block".into(),
            device: "disk".into(),
            driver: DiskDriverXml { name: "qemu".into(), driver_type: "raw".into() },
            source: if is_lv {
                DiskSourceXml { dev: Some(path.clone()), file: None }
            } else {
                DiskSourceXml { dev: None, file: Some(path.clone()) }
            },
            target: DiskTargetXml { dev, bus: "virtio".into() },
        });
    }

    if let Some(cfg) = config_drive_path {
        disks.push(DiskXml {
            disk_type: "file".into(),
            device: "cdrom".into(),
            driver: DiskDriverXml { name: "qemu".into(), driver_type: "raw".into() },
            source: DiskSourceXml { dev: None, file: Some(cfg.to_string()) },
            target: DiskTargetXml { dev: "sda".into(), bus: "sata".into() },
        });
    }

    let interfaces = vm
        .interfaces
        .iter()
        .filter_map(|(_, iface)| {
            iface.mac.as_ref().map(|mac| InterfaceXml {
                iface_type: "network".into(),
                mac: MacXml { address: mac.clone() },
                source: InterfaceSourceXml { network: iface.source_net.clone() },
                model: InterfaceModelXml { model_type: "virtio".into() },
            })
        })
        .collect();

    let domain = DomainXml {
        domain_type: "kvm".into(),
        name: vm.name.clone(),
        uuid: vm.instance_id.to_string(),
        memory: MemoryXml { unit: "MiB".into(), value: vm.resources.max_ram_mib },
        current_memory: MemoryXml { unit: "MiB".into(), value: vm.resources.base_ram_mib },
        vcpu: vm.resources.cpu_count,
        os: OsXml {
            os_type: OsTypeXml { arch: "x86_64".into(), value: "hvm".into() },
            boot: BootXml { dev: "hd".into() },
        },
        features: FeaturesXml { acpi: Empty {}, apic: Empty {} },
        devices: DevicesXml { disks, interfaces },
    };

    facet_xml::to_string(&domain).map_err(|e| VmBuilderError::TemplateRenderFailed {
        name: vm.vm_template.clone(),
        message: e.to_string(),
    })
}

/// Minimal NoCloud `user-data`: just enough for the guest to authorize
/// keys and phone home. `#cloud-config` + a phone-home module, literally
/// transcribed rather than run through a Jinja engine.
pub fn render_user_data(vm: &VmRecord) -> String {
    let mut out = String::from("#cloud-config\n");
    out.push_str("ssh_authorized_keys:\n");
    for key in &vm.network_env.ssh_authorized_keys {
        out.push_str(&format!("  - {key}\n"));
    }
    out.push_str(&format!("password: {}\n", vm.admin_password));
    out.push_str("chpasswd:\n  expire: false\n");
    if let Some(proxy) = &vm.network_env.http_proxy {
        out.push_str(&format!("apt:\n  http_proxy: {proxy}\n"));
    }
    out.push_str("phone_home:\n");
    out.push_str(&format!("  url: {}\n", vm.network_env.web_callback_url));
    out.push_str("  post: [hostname, instance_id, pub_key_rsa]\n");
    out
}

/// Minimal NoCloud `meta-data`: instance-id and hostname.
pub fn render_meta_data(vm: &VmRecord) -> String {
    format!("instance-id: {}\nlocal-hostname: {}\n", vm.instance_id, vm.name)
}

/// Minimal Windows Autounattend answer file: just enough to set the admin
/// password and run the phone-home script post-install. Real deployments
/// would carry a far larger answer file; this is the interface boundary's
/// concrete stand-in, not a faithful unattend.xml.
pub fn render_autounattend(vm: &VmRecord) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         <unattend xmlns=\"urn:schemas-microsoft-com:unattend\">\n\
         \x20 <settings pass=\"oobeSystem\">\n\
         \x20   <component name=\"Microsoft-Windows-Shell-Setup\">\n\
         \x20     <UserAccounts>\n\
         \x20       <AdministratorPassword>\n\
         \x20         <Value>{password}</Value>\n\
         \x20         <PlainText>true</PlainText>\n\
         \x20       </AdministratorPassword>\n\
         \x20     </UserAccounts>\n\
         \x20   </component>\n\
         \x20 </settings>\n\
         \x20 <!-- instance {instance_id}, phone home to {callback} -->\n\
         </unattend>\n",
        password = vm.admin_password,
        instance_id = vm.instance_id,
        callback = vm.network_env.web_callback_url,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{NetworkEnv, ResolvedInterface, VmResources};
    use uuid::Uuid;

    fn sample_vm() -> VmRecord {
        let mut drives = BTreeMap::new();
        drives.insert(
            "os".to_string(),
            DriveResolved::Lv { vg: "vg0".into(), thin_pool: "thin0".into(), disk_size_mib: 20_000 },
        );
        drives.insert("install_image".to_string(), DriveResolved::Path("/srv/img/ubuntu.raw".into()));

        VmRecord {
            name: "web1".into(),
            role: "web".into(),
            instance_id: Uuid::nil(),
            distro: "ubuntu".into(),
            distro_release: "jammy".into(),
            admin_password: "changeme".into(),
            resources: VmResources { cpu_count: 2, base_ram_mib: 1024, max_ram_mib: 2048, swap_size_mib: 2048, swap_label: "MOREVM".into() },
            drives,
            interfaces: vec![(
                "default".to_string(),
                ResolvedInterface { source_net: "default".into(), mac: Some("52:54:00:11:22:33".into()) },
            )],
            network_env: NetworkEnv {
                hypervisor_ip: "192.168.122.1".into(),
                http_proxy: None,
                web_callback_url: "http://192.168.122.1:8080".into(),
                ssh_authorized_keys: vec!["ssh-rsa AAA".into()],
                whoami: "root".into(),
            },
            vm_template: "vm.xml".into(),
            ansible_password: None,
        }
    }

    #[test]
    fn domain_xml_omits_install_image_as_a_disk() {
        let vm = sample_vm();
        let mut devices = BTreeMap::new();
        devices.insert("os".to_string(), "/dev/mapper/vg0-web1--os".to_string());
        devices.insert("install_image".to_string(), "/srv/img/ubuntu.raw".to_string());

        let xml = render_domain_xml(&vm, &devices, Some("/cache/web1-config.iso")).unwrap();
        assert!(xml.contains("vg0-web1--os"));
        assert!(!xml.contains("ubuntu.raw"));
        assert!(xml.contains("web1-config.iso"));
        assert!(xml.contains("52:54:00:11:22:33"));
    }

    #[test]
    fn user_data_includes_keys_and_callback() {
        let vm = sample_vm();
        let rendered = render_user_data(&vm);
        assert!(rendered.contains("ssh-rsa AAA"));
        assert!(rendered.contains("http://192.168.122.1:8080"));
    }

    #[test]
    fn meta_data_includes_instance_id_and_hostname() {
        let vm = sample_vm();
        let rendered = render_meta_data(&vm);
        assert!(rendered.contains("web1"));
        assert!(rendered.contains(&vm.instance_id.to_string()));
    }
}
