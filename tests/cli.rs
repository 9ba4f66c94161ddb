use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn vmbuilder() -> assert_cmd::Command {
    cargo_bin_cmd!("vmbuilder").into()
}

#[test]
fn help_works() {
    vmbuilder().arg("--help").assert().success().stdout(predicate::str::contains("Provision a fleet of libvirt VMs"));
}

#[test]
fn missing_cluster_file_shows_error() {
    vmbuilder()
        .args(["-c", "/nonexistent/cluster.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load cluster definition"));
}

#[test]
fn malformed_cluster_yaml_shows_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cluster.yaml");
    std::fs::write(&path, "not: [valid, cluster").unwrap();

    vmbuilder()
        .args(["-c", path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to parse cluster definition"));
}

#[test]
fn unknown_target_host_shows_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cluster.yaml");
    std::fs::write(
        &path,
        r#"
cluster_name: demo
hosts:
  web:
    - name: web1
machine:
  drives:
    os:
      vg: vg0
      thin_pool: thin0
      disk_size_mb: 20000
  interfaces:
    default:
      source_net: default
source_image:
  path: /srv/img/ubuntu.raw
distro_release: jammy
admin_password: changeme
"#,
    )
    .unwrap();

    vmbuilder()
        .args(["-c", path.to_str().unwrap(), "no-such-host"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no host named 'no-such-host'"));
}
