//! Minimal `dig`-driven DNS helper. The core never links a DNS resolver
//! library — it shells out, exactly as it shells out to every other
//! host tool it depends on.

use crate::error::VmBuilderError;
use crate::subprocess;

/// Reverse-resolve `ip` to a FQDN via `dig -x`.
pub async fn reverse_resolve(ip: &str) -> Result<String, VmBuilderError> {
    let args = ["+noall", "+answer", "-x", ip];
    let out = subprocess::run("dig", &args).await?;
    let text = String::from_utf8_lossy(&out);
    let line = text.trim();
    if line.is_empty() {
        return Err(VmBuilderError::NoSuchIp { ip: ip.to_string() });
    }
    // "21.0.253.10.in-addr.arpa. 0 IN PTR saceph-mon.vm.ceph.example.com."
    let fqdn = line
        .split_whitespace()
        .last()
        .ok_or_else(|| VmBuilderError::NoSuchIp { ip: ip.to_string() })?;
    Ok(fqdn.trim_end_matches('.').to_string())
}

/// Forward-resolve `name` to an IP via `dig`.
pub async fn resolve(name: &str) -> Result<String, VmBuilderError> {
    let out = subprocess::run("dig", &["+noall", "+answer", name]).await?;
    let text = String::from_utf8_lossy(&out);
    text.trim()
        .split_whitespace()
        .last()
        .map(str::to_string)
        .ok_or_else(|| VmBuilderError::NoSuchHost { target: name.to_string() })
}

/// Best-effort FQDN guess: if `hostname` already has a dot, trust it;
/// otherwise try a reverse lookup of `ip` and fall back to `hostname`
/// on any DNS failure.
pub async fn guess_fqdn(ip: Option<&str>, hostname: &str) -> String {
    if hostname.contains('.') {
        return hostname.to_string();
    }
    match ip {
        Some(ip) => match reverse_resolve(ip).await {
            Ok(fqdn) => fqdn,
            Err(_) => {
                tracing::warn!(ip, "could not reverse-resolve IP, using bare hostname");
                hostname.to_string()
            }
        },
        None => hostname.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guess_fqdn_passes_through_dotted_hostname() {
        assert_eq!(guess_fqdn(Some("10.0.0.2"), "web1.example.com").await, "web1.example.com");
    }

    #[tokio::test]
    async fn guess_fqdn_falls_back_without_ip() {
        assert_eq!(guess_fqdn(None, "web1").await, "web1");
    }
}
