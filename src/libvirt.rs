//! CLI-driven libvirt adapter: define/start/destroy domains, read and
//! preserve interface MACs, read network metadata. Every operation here
//! shells out to `virsh` — this crate never links a native libvirt client.

use facet::Facet;

use crate::error::VmBuilderError;
use crate::subprocess;

pub const DEFAULT_CONNECTION: &str = "qemu:///system";

#[derive(Debug, Facet)]
struct MacXml {
    #[facet(xml::attribute)]
    address: String,
}

#[derive(Debug, Facet)]
struct SourceXml {
    #[facet(xml::attribute)]
    network: Option<String>,
}

#[derive(Debug, Facet)]
struct InterfaceXml {
    source: Option<SourceXml>,
    mac: Option<MacXml>,
}

#[derive(Debug, Facet)]
struct DevicesXml {
    #[facet(rename = "interface", default)]
    interfaces: Vec<InterfaceXml>,
}

#[derive(Debug, Facet)]
struct DomainXml {
    name: String,
    devices: DevicesXml,
}

#[derive(Debug, Facet)]
struct DomainRefXml {
    #[facet(xml::attribute)]
    name: Option<String>,
}

#[derive(Debug, Facet)]
struct NetworkIpXml {
    #[facet(xml::attribute)]
    address: Option<String>,
}

#[derive(Debug, Facet)]
struct NetworkXml {
    name: String,
    domain: Option<DomainRefXml>,
    ip: Option<NetworkIpXml>,
}

fn parse_domain_xml(raw: &str) -> Result<DomainXml, VmBuilderError> {
    facet_xml::from_str(raw).map_err(|e| VmBuilderError::Libvirt {
        message: format!("failed to parse domain XML: {e}"),
        hint: "is virsh dumpxml returning well-formed XML?".into(),
    })
}

fn parse_network_xml(raw: &str) -> Result<NetworkXml, VmBuilderError> {
    facet_xml::from_str(raw).map_err(|e| VmBuilderError::Libvirt {
        message: format!("failed to parse network XML: {e}"),
        hint: "is virsh net-dumpxml returning well-formed XML?".into(),
    })
}

/// Does a domain named `name` exist (in any state)?
pub async fn vm_exists(name: &str, conn: &str) -> Result<bool, VmBuilderError> {
    match subprocess::run("virsh", &["-c", conn, "domstate", name]).await {
        Ok(_) => Ok(true),
        Err(VmBuilderError::SubprocessFailed { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Dump a domain's current XML definition.
pub async fn dump_xml(name: &str, conn: &str) -> Result<String, VmBuilderError> {
    let out = subprocess::run("virsh", &["-c", conn, "dumpxml", name]).await?;
    Ok(String::from_utf8_lossy(&out).trim().to_string())
}

/// Dump a libvirt network's XML definition.
pub async fn net_dump_xml(name: &str, conn: &str) -> Result<String, VmBuilderError> {
    let out = subprocess::run("virsh", &["-c", conn, "net-dumpxml", name]).await?;
    Ok(String::from_utf8_lossy(&out).trim().to_string())
}

/// The bridge/host IP address of a libvirt network, if any.
pub async fn net_host_ip(name: &str, conn: &str) -> Result<Option<String>, VmBuilderError> {
    let raw = net_dump_xml(name, conn).await?;
    let net = parse_network_xml(&raw)?;
    Ok(net.ip.and_then(|ip| ip.address))
}

/// The DNS domain name libvirt's dnsmasq serves for this network, if set.
pub async fn net_domain(name: &str, conn: &str) -> Result<Option<String>, VmBuilderError> {
    let raw = net_dump_xml(name, conn).await?;
    let net = parse_network_xml(&raw)?;
    Ok(net.domain.and_then(|d| d.name))
}

/// Map every `source_net` of `name`'s network interfaces to its MAC address.
pub async fn get_vm_macs(
    name: &str,
    conn: &str,
) -> Result<std::collections::BTreeMap<String, String>, VmBuilderError> {
    if !vm_exists(name, conn).await? {
        return Ok(std::collections::BTreeMap::new());
    }
    let raw = dump_xml(name, conn).await?;
    let dom = parse_domain_xml(&raw)?;

    let mut macs = std::collections::BTreeMap::new();
    for iface in dom.devices.interfaces {
        let Some(source) = iface.source.and_then(|s| s.network) else {
            continue;
        };
        let Some(mac) = iface.mac.map(|m| m.address) else {
            continue;
        };
        macs.insert(source, mac);
    }
    Ok(macs)
}

/// Destroy (and optionally undefine) a domain. No-op if it doesn't exist.
/// Running domains are shut down with `virsh destroy` first.
pub async fn destroy(name: &str, undefine: bool, conn: &str) -> Result<(), VmBuilderError> {
    let state = match subprocess::run("virsh", &["-c", conn, "domstate", name]).await {
        Ok(out) => String::from_utf8_lossy(&out).trim().to_string(),
        Err(_) => return Ok(()),
    };

    if state == "running" {
        subprocess::run("virsh", &["-c", conn, "destroy", name]).await?;
    }
    if undefine {
        subprocess::run("virsh", &["-c", conn, "undefine", name]).await?;
    }
    Ok(())
}

/// Define a domain from raw XML, fed to `virsh define` on stdin.
/// Destroys and undefines any pre-existing domain of the same name first.
pub async fn define(xml: &str, conn: &str) -> Result<(), VmBuilderError> {
    let dom = parse_domain_xml(xml)?;
    destroy(&dom.name, true, conn).await?;
    subprocess::run_with_stdin("virsh", &["-c", conn, "define", "/dev/stdin"], xml.as_bytes()).await?;
    Ok(())
}

/// Start a defined domain.
pub async fn start(name: &str, conn: &str) -> Result<(), VmBuilderError> {
    subprocess::run("virsh", &["-c", conn, "start", name]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_DOMAIN_XML: &str = r#"<domain type='kvm'>
  <name>db1</name>
  <devices>
    <interface type='network'>
      <mac address='52:54:00:11:22:33'/>
      <source network='default'/>
    </interface>
  </devices>
</domain>"#;

    const SAMPLE_NETWORK_XML: &str = r#"<network>
  <name>default</name>
  <domain name='vms.example.com'/>
  <ip address='192.168.122.1' netmask='255.255.255.0'/>
</network>"#;

    #[test]
    fn parses_domain_name_and_macs() {
        let dom = parse_domain_xml(SAMPLE_DOMAIN_XML).unwrap();
        assert_eq!(dom.name, "db1");
        assert_eq!(dom.devices.interfaces.len(), 1);
        let iface = &dom.devices.interfaces[0];
        assert_eq!(iface.mac.as_ref().unwrap().address, "52:54:00:11:22:33");
        assert_eq!(iface.source.as_ref().unwrap().network.as_deref(), Some("default"));
    }

    #[test]
    fn parses_network_host_ip_and_domain() {
        let net = parse_network_xml(SAMPLE_NETWORK_XML).unwrap();
        assert_eq!(net.ip.unwrap().address.as_deref(), Some("192.168.122.1"));
        assert_eq!(net.domain.unwrap().name.as_deref(), Some("vms.example.com"));
    }
}
