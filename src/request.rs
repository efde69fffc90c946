//! Request and specification types that flow between the CLI, the validator,
//! the hypervisor drivers and persistence.
//!
//! [`CreateRequest`] is the raw, string-typed request as received from the
//! command line. [`VmSpec`] is what the validator resolves it into.
//! [`CreateRecord`] is the versioned, plain-data form persisted under the VM
//! name; it carries no behaviour and no transient fields.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version of [`CreateRecord`].
pub const CREATE_RECORD_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Raw request
// ---------------------------------------------------------------------------

/// Caller-supplied arguments for a create (or propagate) request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateRequest {
    pub name: String,
    /// `;;`-separated image list, e.g. `file://root.img;;blankcreate://scratch-size-512`.
    pub images: String,
    /// `;;`-separated guest device names, one per image.
    pub imagemounts: String,
    /// `;;`-separated NIC strings.
    pub networking: Option<String>,
    pub memory_mb: Option<u64>,
    pub vcpus: Option<u32>,
    pub kernel: Option<String>,
    pub kernel_args: Option<String>,
    pub ramdisk: Option<String>,
    /// `;;`-separated `src;dst` pairs.
    pub mount_tasks: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved specification
// ---------------------------------------------------------------------------

/// How an image reaches node-local storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageScheme {
    File,
    Gsiftp,
    Scp,
    BlankCreate,
}

impl ImageScheme {
    pub fn parse(scheme: &str) -> Option<Self> {
        match scheme {
            "file" => Some(ImageScheme::File),
            "gsiftp" => Some(ImageScheme::Gsiftp),
            "scp" => Some(ImageScheme::Scp),
            "blankcreate" => Some(ImageScheme::BlankCreate),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ImageScheme::File => "file",
            ImageScheme::Gsiftp => "gsiftp",
            ImageScheme::Scp => "scp",
            ImageScheme::BlankCreate => "blankcreate",
        }
    }

    /// Remote schemes must be propagated before the VM can boot.
    pub fn is_remote(self) -> bool {
        matches!(self, ImageScheme::Gsiftp | ImageScheme::Scp)
    }
}

/// One disk attached to the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub scheme: ImageScheme,
    /// The image string as requested (`scheme://path`).
    pub source: String,
    /// Resolved node-local path.
    pub path: PathBuf,
    /// Guest device name, e.g. `sda1`.
    pub mountpoint: String,
    pub is_readonly: bool,
    pub is_root: bool,
    pub needs_propagation: bool,
    pub blankspace_mb: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfigurationMode {
    Independent,
    Static,
}

/// Requested MAC or IP: a concrete value or "allocate one for me".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Requested<T> {
    Any,
    Value(T),
}

impl<T> Requested<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Requested::Any => None,
            Requested::Value(v) => Some(v),
        }
    }
}

/// Optional per-NIC credential material passed to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicCertificate {
    pub certname: String,
    pub keyname: String,
    pub certpath: String,
    pub keypath: String,
}

/// Network interface of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nic {
    pub name: String,
    pub association: String,
    pub mac: Requested<String>,
    pub bridge: String,
    pub vif_name: String,
    pub dhcp_vif_name: String,
    pub configuration_mode: ConfigurationMode,
    /// `Some(Any)` for STATIC NICs whose address comes from the pool.
    pub ip: Option<Requested<Ipv4Addr>>,
    pub gateway: Option<Ipv4Addr>,
    pub broadcast: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub hostname: Option<String>,
    pub certificate: Option<NicCertificate>,
}

impl Nic {
    /// The concrete MAC; `None` until allocation has happened.
    pub fn mac_value(&self) -> Option<&str> {
        self.mac.value().map(String::as_str)
    }

    /// The concrete IPv4 address, if assigned.
    pub fn ip_value(&self) -> Option<Ipv4Addr> {
        self.ip.as_ref().and_then(|ip| ip.value().copied())
    }
}

/// File copied into the root image before boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountTask {
    pub source: PathBuf,
    pub guest_path: String,
}

/// Fully resolved VM specification, ready for a [`crate::vm::VmmDriver`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub memory_mb: u64,
    pub vcpus: u32,
    pub kernel: Option<PathBuf>,
    pub kernel_args: Option<String>,
    pub ramdisk: Option<PathBuf>,
    pub partitions: Vec<Partition>,
    pub nics: Vec<Nic>,
    pub mount_tasks: Vec<MountTask>,
}

impl VmSpec {
    pub fn root_partition(&self) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.is_root)
    }
}

/// Persisted form of a created VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRecord {
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub spec: VmSpec,
}

impl CreateRecord {
    pub fn new(spec: VmSpec) -> Self {
        Self {
            schema_version: CREATE_RECORD_SCHEMA_VERSION,
            created_at: Utc::now(),
            spec,
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmRunState {
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    Shutoff,
    Crashed,
    Absent,
}

impl VmRunState {
    /// Whether the domain is gone as far as the shutdown protocol cares.
    pub fn is_down(self) -> bool {
        matches!(self, VmRunState::Shutoff | VmRunState::Absent)
    }
}

/// What the hypervisor reports about a VM right now. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningVm {
    pub handle: String,
    pub vmm_id: Option<u32>,
    pub vmm_uuid: Option<String>,
    pub mem_mb: u64,
    pub vcpus: u32,
    pub cputime_secs: f64,
    pub state: VmRunState,
}
