use clap::Parser;
use tracing_subscriber::EnvFilter;

use vmbuilder::cli::{Cli, VmTarget};
use vmbuilder::config::{self, ClusterDef, VmDef};
use vmbuilder::error::VmBuilderError;
use vmbuilder::image_cloner::is_windows_distro;
use vmbuilder::orchestrator::{self, OrchestratorConfig};
use vmbuilder::progress::OutputMode;
use vmbuilder::{image, libvirt, merge, paths};

/// Resolve the CLI's `VM:ROLE` targets against the cluster definition.
/// With no targets given, every declared host is in scope.
fn resolve_targets(cluster: &ClusterDef, targets: &[VmTarget]) -> Result<Vec<(VmDef, String)>, VmBuilderError> {
    if targets.is_empty() {
        let mut resolved = Vec::new();
        for (role, vms) in &cluster.hosts {
            for vm in vms {
                resolved.push((vm.clone(), role.clone()));
            }
        }
        return Ok(resolved);
    }

    let mut resolved = Vec::with_capacity(targets.len());
    for target in targets {
        let mut found = None;
        for (role, vms) in &cluster.hosts {
            if let Some(want_role) = &target.role {
                if want_role != role {
                    continue;
                }
            }
            if let Some(vm) = vms.iter().find(|v| v.name.eq_ignore_ascii_case(&target.name)) {
                found = Some((vm.clone(), role.clone()));
                break;
            }
        }
        let found = found.ok_or_else(|| VmBuilderError::Validation {
            message: format!(
                "no host named '{}'{} in cluster definition",
                target.name,
                target.role.as_ref().map(|r| format!(" with role '{r}'")).unwrap_or_default(),
            ),
        })?;
        resolved.push(found);
    }
    Ok(resolved)
}

fn progress_mode(verbose: bool) -> OutputMode {
    if !console::user_attended() {
        OutputMode::Plain
    } else if verbose {
        OutputMode::Verbose
    } else {
        OutputMode::Normal
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive("vmbuilder=info".parse().expect("valid log directive"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cluster = config::load_cluster_def(&cli.cluster)?;
    let targets = resolve_targets(&cluster, &cli.targets)?;
    if targets.is_empty() {
        return Err(VmBuilderError::Validation { message: "cluster declares no hosts to target".into() }.into());
    }

    let conn = libvirt::DEFAULT_CONNECTION.to_string();

    if cli.delete {
        let mut records = Vec::with_capacity(targets.len());
        for (vm, role) in &targets {
            records.push(merge::merge_vm_info(&cluster, vm, role, "", &conn).await?);
        }
        orchestrator::delete(&records, &conn).await?;
        println!("deleted {} host(s)", records.len());
        return Ok(());
    }

    let install_image = image::ensure_source_image(&cluster.source_image, &paths::image_cache_dir()).await?;

    let mut records = Vec::with_capacity(targets.len());
    for (vm, role) in &targets {
        records.push(merge::merge_vm_info(&cluster, vm, role, &install_image.to_string_lossy(), &conn).await?);
    }

    let layout = if records.iter().any(|vm| !is_windows_distro(&vm.distro)) {
        Some(vmbuilder::image_cloner::inspect_source_image(&install_image).await?)
    } else {
        None
    };

    let parallel = cli.parallel.unwrap_or(records.len()).max(1);
    let parallel_provision = cli.provision_jobs.unwrap_or_else(|| (records.len() / 2).max(1));

    let cfg = OrchestratorConfig {
        libvirt_conn: conn,
        redefine: cli.redefine,
        parallel_provision,
        parallel,
        cache_dir: paths::config_drive_dir(),
        inventory_path: paths::inventory_path(&cluster.cluster_name),
        ssh_config_path: paths::ssh_config_path(&cluster.cluster_name),
        listen: cli.listen.clone(),
        progress_mode: progress_mode(cli.verbose),
    };

    orchestrator::run(records, cfg, install_image, layout).await?;
    println!("all guests reported ready");
    Ok(())
}
