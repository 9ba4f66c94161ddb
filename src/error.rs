use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum VmBuilderError {
    #[error("failed to load cluster definition from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse cluster definition from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("failed to download image: {message}")]
    ImageDownload {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{cmd} exited with status {exit_code}: {stderr}")]
    #[diagnostic(help("ensure {cmd} is installed and accessible on PATH"))]
    SubprocessFailed {
        cmd: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("no such logical volume {vg}/{lv}")]
    #[diagnostic(help("run `lvs {vg}` to see what logical volumes actually exist"))]
    NoSuchLv { vg: String, lv: String },

    #[error("no such volume group {vg}")]
    #[diagnostic(help("run `vgs` to see what volume groups actually exist"))]
    NoSuchVg { vg: String },

    #[error("no known_hosts entry for {target}")]
    NoSuchHost { target: String },

    #[error("no DNS record for {ip}")]
    NoSuchIp { ip: String },

    #[error("{path} is not a block device")]
    #[diagnostic(help("check that the LV was activated before provisioning began"))]
    NotABlockDevice { path: String },

    #[error("disk too small: {disk_size} sectors < {required} sectors required")]
    #[diagnostic(help("grow the target LV or shrink swap_size/config drive before retrying"))]
    DiskTooSmall { disk_size: u64, required: u64 },

    #[error("unsupported filesystem {fstype:?} on {device}")]
    #[diagnostic(help("only ext2/ext3/ext4 source images are supported"))]
    UnsupportedFilesystem { device: String, fstype: Option<String> },

    #[error("bad partition table on {device}: {message}")]
    BadPartitionTable { device: String, message: String },

    #[error("failed to render template for {name}: {message}")]
    TemplateRenderFailed { name: String, message: String },

    #[error("malformed phone-home request: {message}")]
    MalformedRequest { message: String },

    #[error("libvirt error: {message}")]
    #[diagnostic(help("{hint}"))]
    Libvirt { message: String, hint: String },

    #[error("domain '{name}' not found")]
    #[diagnostic(help("run with --redefine to create the domain first"))]
    DomainNotFound { name: String },

    #[error("network '{name}' not found")]
    #[diagnostic(help("every source_net referenced by a VM's interfaces must already exist in libvirt"))]
    NetworkNotFound { name: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker for '{name}' failed during {phase}")]
    WorkerFailed {
        name: String,
        phase: String,
        #[source]
        source: Box<VmBuilderError>,
    },

    #[error("ansible_password is required for windows host '{name}'")]
    #[diagnostic(help("set admin_password (or a per-host override) for every windows-role VM"))]
    MissingAnsiblePassword { name: String },
}

pub type Result<T> = std::result::Result<T, VmBuilderError>;
