//! The provisioning orchestrator (C11): fans every target `VmRecord` out
//! to a bounded worker pool (config-drive build -> LV creation -> define
//! -> destroy -> clone), then launches each finished VM through an
//! admission gate sized by the first-boot concurrency budget, and waits
//! for every guest to phone home before returning.
//!
//! Three roles run concurrently, connected by channels rather than shared
//! mutable state:
//!   - workers (bounded by `--provision-jobs`) drive C6/C7 for one VM each
//!   - the launcher (this task) calls `virsh start` as workers finish,
//!     gated by an admission semaphore sized by `--parallel`
//!   - the phone-home consumer (C9) releases admission/I-O permits and
//!     updates inventory/ssh_config/known_hosts as guests report in

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use crate::cloudinit::{self, DriveFile};
use crate::error::VmBuilderError;
use crate::image_cloner::{self, is_windows_distro, CloneTarget, SourceLayout};
use crate::inventory::{HostEntry, InventoryGenerator};
use crate::known_hosts;
use crate::libvirt;
use crate::lvm;
use crate::merge::{DriveResolved, VmRecord};
use crate::phonehome::{self, GuestReport, Hook, PhoneHomeServer};
use crate::progress::{FleetProgress, OutputMode, VmBar};
use crate::ssh_config::SshConfigGenerator;
use crate::templates;
use crate::throttle::IoThrottler;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub libvirt_conn: String,
    pub redefine: bool,
    pub parallel_provision: usize,
    pub parallel: usize,
    pub cache_dir: PathBuf,
    pub inventory_path: PathBuf,
    pub ssh_config_path: PathBuf,
    pub listen: String,
    pub progress_mode: OutputMode,
}

fn lv_name(vm_name: &str, role: &str) -> String {
    format!("{vm_name}-{role}")
}

fn mib_to_sectors(mib: u64) -> u64 {
    mib * 1024 * 1024 / 512
}

fn random_mac() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", rng.gen::<u8>(), rng.gen::<u8>(), rng.gen::<u8>())
}

/// Clone `vm`, filling in any interface missing a MAC from `macs` (keyed
/// by source network) so a `--redefine` doesn't hand out new addresses to
/// interfaces libvirt already knows.
fn with_preserved_macs(vm: &VmRecord, macs: &BTreeMap<String, String>) -> VmRecord {
    let mut vm = vm.clone();
    for (_, iface) in vm.interfaces.iter_mut() {
        if iface.mac.is_none() {
            iface.mac = Some(macs.get(&iface.source_net).cloned().unwrap_or_else(random_mac));
        }
    }
    vm
}

/// A first-boot concurrency budget: `acquire` before starting a domain,
/// held until the phone-home hook chain releases it for the same
/// instance. Mirrors [`IoThrottler`]'s acquire/release-by-key shape.
struct AdmissionGate {
    sem: Arc<Semaphore>,
    held: std::sync::Mutex<HashMap<String, tokio::sync::OwnedSemaphorePermit>>,
}

impl AdmissionGate {
    fn new(permits: usize) -> Self {
        Self { sem: Arc::new(Semaphore::new(permits.max(1))), held: std::sync::Mutex::new(HashMap::new()) }
    }

    async fn acquire(&self, instance_id: &str) -> Result<(), VmBuilderError> {
        let permit = self.sem.clone().acquire_owned().await.map_err(|_| VmBuilderError::Validation {
            message: "admission semaphore closed".into(),
        })?;
        self.held.lock().expect("admission mutex poisoned").insert(instance_id.to_string(), permit);
        Ok(())
    }

    fn release(&self, instance_id: &str) {
        self.held.lock().expect("admission mutex poisoned").remove(instance_id);
    }
}

type WorkerFailure = (String, String, VmBuilderError);

/// Per-VM pipeline: render config drive, ensure LVs, (optionally) redefine
/// the domain, destroy any running instance, then clone the rootfs (or, for
/// Windows, just zero the partition table). Returns the VM name on success.
async fn provision_one(
    vm: VmRecord,
    cfg: OrchestratorConfig,
    layout: Option<SourceLayout>,
    source_img: Arc<PathBuf>,
    throttler: Arc<IoThrottler>,
    bar: Arc<VmBar>,
) -> Result<String, WorkerFailure> {
    let wrap = |phase: &str, e: VmBuilderError| (vm.name.clone(), phase.to_string(), e);
    let windows = is_windows_distro(&vm.distro);

    bar.set_phase("rendering config drive");
    let cfg_path = cloudinit::image_path(&cfg.cache_dir, &vm.name, windows);
    if windows {
        let content = cloudinit::to_crlf(&templates::render_autounattend(&vm));
        let files = vec![DriveFile { name: "Autounattend.xml".into(), contents: content.into_bytes() }];
        cloudinit::build_autounattend_fat(&cfg_path, &files).await.map_err(|e| wrap("config-drive", e))?;
    } else {
        let files = vec![
            DriveFile { name: "user-data".into(), contents: templates::render_user_data(&vm).into_bytes() },
            DriveFile { name: "meta-data".into(), contents: templates::render_meta_data(&vm).into_bytes() },
        ];
        cloudinit::build_nocloud_iso(&cfg_path, &files).await.map_err(|e| wrap("config-drive", e))?;
    }

    bar.set_phase("ensuring logical volumes");
    let mut drive_devices: BTreeMap<String, String> = BTreeMap::new();
    for (role, drive) in &vm.drives {
        match drive {
            DriveResolved::Lv { vg, thin_pool, disk_size_mib } => {
                let lv = lv_name(&vm.name, role);
                lvm::create_thin_lv(vg, thin_pool, &lv, *disk_size_mib, false).await.map_err(|e| wrap("lvcreate", e))?;
                let dm = image_cloner::get_dm_lv_name(&format!("/dev/{vg}/{lv}")).map_err(|e| wrap("lvcreate", e))?;
                drive_devices.insert(role.clone(), dm);
            }
            DriveResolved::Path(path) => {
                drive_devices.insert(role.clone(), path.clone());
            }
        }
    }

    let os_vg = match vm.drives.get("os") {
        Some(DriveResolved::Lv { vg, .. }) => Some(vg.clone()),
        _ => None,
    };
    if let Some(vg) = &os_vg {
        bar.set_phase("waiting for an I/O permit");
        throttler.acquire(&vm.instance_id.to_string(), vg).await.map_err(|e| wrap("io-throttle", e))?;
    }

    if cfg.redefine {
        bar.set_phase("defining domain");
        let macs = libvirt::get_vm_macs(&vm.name, &cfg.libvirt_conn).await.map_err(|e| wrap("define", e))?;
        let vm_for_xml = with_preserved_macs(&vm, &macs);
        let config_drive_xml_path = windows.then(|| cfg_path.to_string_lossy().into_owned());
        let xml = templates::render_domain_xml(&vm_for_xml, &drive_devices, config_drive_xml_path.as_deref())
            .map_err(|e| wrap("define", e))?;
        libvirt::define(&xml, &cfg.libvirt_conn).await.map_err(|e| wrap("define", e))?;
    }

    bar.set_phase("destroying any running instance");
    libvirt::destroy(&vm.name, false, &cfg.libvirt_conn).await.map_err(|e| wrap("destroy", e))?;

    bar.set_phase("cloning rootfs");
    let os_device = drive_devices
        .get("os")
        .ok_or_else(|| wrap("provision", VmBuilderError::Validation { message: format!("VM '{}' has no 'os' drive", vm.name) }))?
        .clone();

    if windows {
        image_cloner::provision_windows(&os_device).await.map_err(|e| wrap("provision", e))?;
    } else {
        let layout = layout.ok_or_else(|| {
            wrap("provision", VmBuilderError::Validation { message: "no source image layout for a unix target".into() })
        })?;
        let target = CloneTarget {
            vdisk: &os_device,
            img: &source_img,
            layout,
            config_drive_img: Some(cfg_path.as_path()),
            swap_size_sectors: mib_to_sectors(vm.resources.swap_size_mib),
            swap_label: &vm.resources.swap_label,
            optimize_rootfs: true,
            anonymize_rootfs: true,
            cleanup_files: image_cloner::CLEANUP_FILES,
            touch_files: image_cloner::TOUCH_FILES,
        };
        image_cloner::provision(&target).await.map_err(|e| wrap("provision", e))?;
    }

    bar.set_phase("provisioned, awaiting launch");
    Ok(vm.name.clone())
}

fn build_hooks(
    records_by_name: Arc<HashMap<String, VmRecord>>,
    admission: Arc<AdmissionGate>,
    throttler: Arc<IoThrottler>,
    inventory: Arc<tokio::sync::Mutex<InventoryGenerator>>,
    ssh_cfg: Arc<tokio::sync::Mutex<SshConfigGenerator>>,
    bars: Arc<HashMap<String, Arc<VmBar>>>,
) -> Vec<Hook> {
    let mut hooks: Vec<Hook> = Vec::new();

    {
        let records_by_name = records_by_name.clone();
        hooks.push(Box::new(move |report: GuestReport| {
            let records_by_name = records_by_name.clone();
            Box::pin(async move {
                let windows =
                    records_by_name.get(&report.hostname.to_ascii_lowercase()).map(|vm| is_windows_distro(&vm.distro)).unwrap_or(false);
                if windows {
                    return Ok(());
                }
                known_hosts::update(&[(Some(report.ip.clone()), report.hostname.clone())], Some(&report.ssh_key)).await
            })
        }));
    }

    {
        let admission = admission.clone();
        let throttler = throttler.clone();
        hooks.push(Box::new(move |report: GuestReport| {
            let admission = admission.clone();
            let throttler = throttler.clone();
            Box::pin(async move {
                admission.release(&report.instance_id);
                throttler.release(&report.instance_id);
                Ok(())
            })
        }));
    }

    {
        let records_by_name = records_by_name.clone();
        let inventory = inventory.clone();
        hooks.push(Box::new(move |report: GuestReport| {
            let records_by_name = records_by_name.clone();
            let inventory = inventory.clone();
            Box::pin(async move {
                let Some(vm) = records_by_name.get(&report.hostname.to_ascii_lowercase()) else { return Ok(()) };
                let entry = HostEntry {
                    ip: report.ip.clone(),
                    windows: is_windows_distro(&vm.distro),
                    ansible_password: vm.ansible_password.clone(),
                };
                let mut inv = inventory.lock().await;
                inv.add(&vm.role, &vm.name, entry.clone()).await?;
                inv.add("all", &vm.name, entry).await
            })
        }));
    }

    {
        let records_by_name = records_by_name.clone();
        let ssh_cfg = ssh_cfg.clone();
        hooks.push(Box::new(move |report: GuestReport| {
            let records_by_name = records_by_name.clone();
            let ssh_cfg = ssh_cfg.clone();
            Box::pin(async move {
                let Some(vm) = records_by_name.get(&report.hostname.to_ascii_lowercase()) else { return Ok(()) };
                let user = if is_windows_distro(&vm.distro) { "administrator" } else { "root" };
                ssh_cfg.lock().await.add(&vm.name, &report.ip, user).await
            })
        }));
    }

    {
        let bars = bars.clone();
        hooks.push(Box::new(move |report: GuestReport| {
            let bars = bars.clone();
            Box::pin(async move {
                if let Some(bar) = bars.get(&report.hostname.to_ascii_lowercase()) {
                    bar.finish_ok();
                }
                Ok(())
            })
        }));
    }

    hooks.push(phonehome::report_ready_hook());
    hooks
}

/// Provision and launch every `VmRecord` in `records`, blocking until all
/// of them have phoned home (or until any worker fails, in which case the
/// failure is returned once every other in-flight worker has run to
/// completion — no worker is cancelled mid-operation).
pub async fn run(
    records: Vec<VmRecord>,
    cfg: OrchestratorConfig,
    source_img: PathBuf,
    layout: Option<SourceLayout>,
) -> Result<(), VmBuilderError> {
    let fleet = FleetProgress::with_multi(cfg.progress_mode);
    let bars: Arc<HashMap<String, Arc<VmBar>>> = Arc::new(
        records.iter().map(|vm| (vm.name.to_ascii_lowercase(), Arc::new(fleet.add_vm(&vm.name, "queued")))).collect(),
    );

    let expected: HashSet<String> = records.iter().map(|vm| vm.name.clone()).collect();
    let records_by_name: Arc<HashMap<String, VmRecord>> =
        Arc::new(records.iter().map(|vm| (vm.name.to_ascii_lowercase(), vm.clone())).collect());

    let mut vgs: Vec<String> = Vec::new();
    for vm in &records {
        for drive in vm.drives.values() {
            if let DriveResolved::Lv { vg, .. } = drive {
                if !vgs.contains(vg) {
                    vgs.push(vg.clone());
                }
            }
        }
    }
    let throttler = Arc::new(IoThrottler::new(&vgs, 0).await?);
    let admission = Arc::new(AdmissionGate::new(cfg.parallel.max(1)));
    let inventory = Arc::new(tokio::sync::Mutex::new(InventoryGenerator::new(cfg.inventory_path.clone())));
    let ssh_cfg = Arc::new(tokio::sync::Mutex::new(SshConfigGenerator::new(cfg.ssh_config_path.clone())));

    let hooks = build_hooks(records_by_name.clone(), admission.clone(), throttler.clone(), inventory, ssh_cfg, bars.clone());
    let (phserver, consumer) = PhoneHomeServer::spawn(expected.clone(), hooks);

    let addr: std::net::SocketAddr = cfg.listen.parse().map_err(|e| VmBuilderError::Validation {
        message: format!("invalid --listen address '{}': {e}", cfg.listen),
    })?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| VmBuilderError::Io {
        context: format!("binding phone-home listener on {addr}"),
        source: e,
    })?;
    tracing::info!(%addr, "phone-home server listening");

    let router = phserver.router.clone();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = consumer.await;
        let _ = shutdown_tx.send(());
    });
    let server_task = tokio::spawn(async move {
        let service = router.into_make_service_with_connect_info::<std::net::SocketAddr>();
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = axum::serve(listener, service).with_graceful_shutdown(shutdown).await {
            tracing::error!(error = %e, "phone-home server exited with an error");
        }
    });

    let worker_sem = Arc::new(Semaphore::new(cfg.parallel_provision.max(1)));
    let (tx, mut rx) = mpsc::unbounded_channel::<Result<String, WorkerFailure>>();
    let source_img = Arc::new(source_img);
    let mut handles = Vec::with_capacity(records.len());
    for vm in records {
        let sem = worker_sem.clone();
        let cfg = cfg.clone();
        let source_img = source_img.clone();
        let throttler = throttler.clone();
        let bar = bars[&vm.name.to_ascii_lowercase()].clone();
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.expect("worker semaphore closed");
            let result = provision_one(vm, cfg, layout, source_img, throttler, bar).await;
            let _ = tx.send(result);
        }));
    }
    drop(tx);

    let launch_result: Result<(), VmBuilderError> = async {
        let mut launched: HashSet<String> = HashSet::new();
        while launched.len() < expected.len() {
            let Some(item) = rx.recv().await else { break };
            match item {
                Ok(name) => {
                    let instance_id = records_by_name.get(&name.to_ascii_lowercase()).map(|vm| vm.instance_id.to_string());
                    if let Some(id) = instance_id {
                        admission.acquire(&id).await?;
                    }
                    libvirt::start(&name, &cfg.libvirt_conn).await?;
                    if let Some(bar) = bars.get(&name.to_ascii_lowercase()) {
                        bar.set_phase("booting, waiting for phone-home");
                    }
                    launched.insert(name);
                }
                Err((name, phase, err)) => {
                    if let Some(bar) = bars.get(&name.to_ascii_lowercase()) {
                        bar.finish_failed(&err.to_string());
                    }
                    return Err(VmBuilderError::WorkerFailed { name, phase, source: Box::new(err) });
                }
            }
        }
        Ok(())
    }
    .await;

    phserver.stop();
    for handle in handles {
        let _ = handle.await;
    }
    let _ = server_task.await;

    launch_result
}

/// Destroy, undefine, and reclaim every LV-backed drive for each target
/// domain. No provisioning happens in this mode.
pub async fn delete(records: &[VmRecord], libvirt_conn: &str) -> Result<(), VmBuilderError> {
    for vm in records {
        tracing::info!(vm = %vm.name, "destroying and undefining domain");
        libvirt::destroy(&vm.name, true, libvirt_conn).await?;
        for (role, drive) in &vm.drives {
            if role == "install_image" {
                continue;
            }
            if let DriveResolved::Lv { vg, .. } = drive {
                let lv = lv_name(&vm.name, role);
                tracing::info!(vm = %vm.name, %vg, lv = %lv, "reclaiming logical volume");
                lvm::remove_lv(vg, &lv).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{NetworkEnv, ResolvedInterface, VmResources};
    use uuid::Uuid;

    fn sample_vm() -> VmRecord {
        let mut drives = BTreeMap::new();
        drives.insert("os".to_string(), DriveResolved::Lv { vg: "vg0".into(), thin_pool: "thin0".into(), disk_size_mib: 20_000 });
        VmRecord {
            name: "web1".into(),
            role: "web".into(),
            instance_id: Uuid::nil(),
            distro: "ubuntu".into(),
            distro_release: "jammy".into(),
            admin_password: "changeme".into(),
            resources: VmResources { cpu_count: 1, base_ram_mib: 512, max_ram_mib: 1024, swap_size_mib: 1024, swap_label: "MOREVM".into() },
            drives,
            interfaces: vec![("default".to_string(), ResolvedInterface { source_net: "default".into(), mac: None })],
            network_env: NetworkEnv {
                hypervisor_ip: "192.168.122.1".into(),
                http_proxy: None,
                web_callback_url: "http://192.168.122.1:8080".into(),
                ssh_authorized_keys: vec![],
                whoami: "root".into(),
            },
            vm_template: "vm.xml".into(),
            ansible_password: None,
        }
    }

    #[test]
    fn lv_name_prefixes_role_with_vm_name() {
        assert_eq!(lv_name("web1", "os"), "web1-os");
    }

    #[test]
    fn preserves_macs_fills_missing_interface_from_libvirt() {
        let vm = sample_vm();
        let mut macs = BTreeMap::new();
        macs.insert("default".to_string(), "52:54:00:11:22:33".to_string());
        let filled = with_preserved_macs(&vm, &macs);
        assert_eq!(filled.interfaces[0].1.mac.as_deref(), Some("52:54:00:11:22:33"));
    }

    #[test]
    fn preserves_macs_generates_one_when_libvirt_has_none() {
        let vm = sample_vm();
        let filled = with_preserved_macs(&vm, &BTreeMap::new());
        assert!(filled.interfaces[0].1.mac.is_some());
    }

    #[tokio::test]
    async fn admission_gate_release_frees_the_permit() {
        let gate = AdmissionGate::new(1);
        gate.acquire("i-1").await.unwrap();
        assert_eq!(gate.sem.available_permits(), 0);
        gate.release("i-1");
        assert_eq!(gate.sem.available_permits(), 1);
    }

    #[tokio::test]
    async fn admission_gate_release_of_unknown_instance_is_a_no_op() {
        let gate = AdmissionGate::new(1);
        gate.release("never-acquired");
        assert_eq!(gate.sem.available_permits(), 1);
    }
}
