use std::path::PathBuf;

/// Base image cache directory: `~/.cache/vmbuilder/images/`.
pub fn image_cache_dir() -> PathBuf {
    dirs::cache_dir().unwrap_or_else(|| PathBuf::from("/tmp")).join("vmbuilder").join("images")
}

/// Config-drive scratch/output directory: `~/.cache/vmbuilder/config-drive/`.
pub fn config_drive_dir() -> PathBuf {
    dirs::cache_dir().unwrap_or_else(|| PathBuf::from("/tmp")).join("vmbuilder").join("config-drive")
}

/// Inventory file path for a cluster: `<cluster_name>/hosts`.
pub fn inventory_path(cluster_name: &str) -> PathBuf {
    PathBuf::from(cluster_name).join("hosts")
}

/// SSH client config path for a cluster: `<cluster_name>/ssh_config`.
pub fn ssh_config_path(cluster_name: &str) -> PathBuf {
    PathBuf::from(cluster_name).join("ssh_config")
}
