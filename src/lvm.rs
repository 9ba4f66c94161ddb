//! Query/create/remove/rename thin logical volumes, and detect whether a
//! volume group is SSD-backed. Everything here is driven through `lvs`,
//! `pvs`, `lvcreate`, `lvremove`, `lvrename` — parsed from their
//! machine-readable, separator-delimited output.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::VmBuilderError;
use crate::subprocess;

/// `lvs`/`lvcreate`/`lvremove` exit with this code when the LV/VG named
/// on the command line doesn't exist.
const LVM_NO_SUCH_LV: i32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ThinLvInfo {
    pub pool_lv: String,
    pub data_percent: f64,
    pub lv_size_mib: f64,
    pub lv_uuid: String,
}

fn is_no_such_lv(err: &VmBuilderError) -> bool {
    matches!(err, VmBuilderError::SubprocessFailed { exit_code, .. } if *exit_code == LVM_NO_SUCH_LV)
}

/// Query the thin LV `vg/lv`. Returns `NoSuchLv` if it doesn't exist.
pub async fn query_thin_lv(vg: &str, lv: &str) -> Result<ThinLvInfo, VmBuilderError> {
    let target = format!("{vg}/{lv}");
    let out = subprocess::run_sudo(
        "lvs",
        &[
            "--noheadings",
            "--nosuffix",
            "--units",
            "m",
            "--separator",
            "|",
            "-o",
            "pool_lv,data_percent,lv_size,lv_uuid",
            &target,
        ],
    )
    .await
    .map_err(|e| {
        if is_no_such_lv(&e) {
            VmBuilderError::NoSuchLv { vg: vg.to_string(), lv: lv.to_string() }
        } else {
            e
        }
    })?;

    let text = String::from_utf8_lossy(&out);
    let fields: Vec<&str> = text.trim().split('|').map(str::trim).collect();
    if fields.len() < 4 {
        return Err(VmBuilderError::NoSuchLv { vg: vg.to_string(), lv: lv.to_string() });
    }

    Ok(ThinLvInfo {
        pool_lv: fields[0].to_string(),
        data_percent: fields[1].parse().unwrap_or(0.0),
        lv_size_mib: fields[2].parse().unwrap_or(0.0),
        lv_uuid: fields[3].to_string(),
    })
}

/// Remove an LV, tolerating "doesn't exist".
pub async fn remove_lv(vg: &str, lv: &str) -> Result<(), VmBuilderError> {
    let target = format!("{vg}/{lv}");
    match subprocess::run_sudo("lvremove", &["-f", &target]).await {
        Ok(_) => Ok(()),
        Err(e) if is_no_such_lv(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

pub async fn rename_lv(vg: &str, old_lv: &str, lv: &str) -> Result<(), VmBuilderError> {
    let old = format!("{vg}/{old_lv}");
    let new = format!("{vg}/{lv}");
    subprocess::run_sudo("lvrename", &[&old, &new]).await?;
    Ok(())
}

/// Create (or no-op) a thin LV. If an LV with the same name already exists
/// in `thin_pool` with matching size, this is a no-op unless `force`.
/// Otherwise the existing LV is removed and recreated.
pub async fn create_thin_lv(
    vg: &str,
    thin_pool: &str,
    name: &str,
    size_mib: u64,
    force: bool,
) -> Result<(), VmBuilderError> {
    match query_thin_lv(vg, name).await {
        Ok(info) => {
            let matches = info.pool_lv == thin_pool && (info.lv_size_mib - size_mib as f64).abs() < 1.0;
            if matches && !force {
                return Ok(());
            }
            remove_lv(vg, name).await?;
        }
        Err(VmBuilderError::NoSuchLv { .. }) => {}
        Err(e) => return Err(e),
    }

    let pool = format!("{vg}/{thin_pool}");
    let size = format!("{size_mib}M");
    subprocess::run_sudo("lvcreate", &["-T", &pool, "-n", name, "-V", &size]).await?;
    Ok(())
}

/// List every VG on the host along with its backing PVs.
pub async fn vgs() -> Result<BTreeMap<String, Vec<String>>, VmBuilderError> {
    let out = subprocess::run_sudo("pvs", &["--noheadings", "--separator", ";", "-o", "vg_name,pv_name"]).await?;
    let text = String::from_utf8_lossy(&out);
    let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, ';');
        let vg = parts.next().unwrap_or("").trim().to_string();
        let pv = parts.next().unwrap_or("").trim().to_string();
        if vg.is_empty() {
            continue;
        }
        result.entry(vg).or_default().push(pv);
    }
    Ok(result)
}

/// Resolve `dev` (a partition, e.g. `/dev/loop0p1`) to its base whole-disk
/// device by walking `/sys/block`.
fn partition_base_device(dev: &str) -> Result<String, VmBuilderError> {
    let canonical = std::fs::canonicalize(dev).map_err(|e| VmBuilderError::Io {
        context: format!("resolving {dev}"),
        source: e,
    })?;
    let devname = canonical.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();

    if Path::new("/sys/block").join(&devname).is_dir() {
        return Ok(canonical.to_string_lossy().into_owned());
    }

    let entries = std::fs::read_dir("/sys/block").map_err(|e| VmBuilderError::Io {
        context: "reading /sys/block".into(),
        source: e,
    })?;
    for entry in entries.flatten() {
        let base = entry.file_name().to_string_lossy().into_owned();
        if Path::new("/sys/block").join(&base).join(&devname).exists() {
            return Ok(format!("/dev/{base}"));
        }
    }

    Err(VmBuilderError::NotABlockDevice { path: dev.to_string() })
}

/// Is `dev` (whole drive or partition) non-rotational?
fn drive_is_ssd(orig_dev: &str) -> Result<bool, VmBuilderError> {
    let mut dev = orig_dev.to_string();
    loop {
        let canonical = std::fs::canonicalize(&dev).map_err(|e| VmBuilderError::Io {
            context: format!("resolving {dev}"),
            source: e,
        })?;
        let devname = canonical.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let rotational = format!("/sys/block/{devname}/queue/rotational");
        if Path::new(&rotational).is_file() {
            let contents = std::fs::read_to_string(&rotational).map_err(|e| VmBuilderError::Io {
                context: format!("reading {rotational}"),
                source: e,
            })?;
            return Ok(contents.trim() == "0");
        }
        let base = partition_base_device(&dev)?;
        if base == canonical.to_string_lossy() {
            return Ok(false);
        }
        dev = base;
    }
}

/// Is every PV backing `vg` non-rotational?
pub async fn vg_is_ssd(vg: &str) -> Result<bool, VmBuilderError> {
    let all_vgs = vgs().await?;
    let pvs = all_vgs.get(vg).ok_or_else(|| VmBuilderError::NoSuchVg { vg: vg.to_string() })?;
    for pv in pvs {
        if !drive_is_ssd(pv)? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_no_such_lv_matches_exit_code_5() {
        let err = VmBuilderError::SubprocessFailed {
            cmd: "lvs".into(),
            exit_code: 5,
            stderr: String::new(),
        };
        assert!(is_no_such_lv(&err));
    }

    #[test]
    fn is_no_such_lv_rejects_other_codes() {
        let err = VmBuilderError::SubprocessFailed {
            cmd: "lvs".into(),
            exit_code: 1,
            stderr: String::new(),
        };
        assert!(!is_no_such_lv(&err));
    }
}
