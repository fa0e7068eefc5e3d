//! Domain model shared between the provisioning logic and providers

use serde::{Deserialize, Serialize};

/// Address reserved for one planned cluster node.
///
/// Identity within a run is the `(region, ip)` pair. `allocation_id` is
/// present only for provider-managed public addresses, which need a handle
/// to be associated with an instance or released again; private addresses
/// are identified by the address alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub region: String,
    pub ip: String,
    pub allocation_id: Option<String>,
}

impl NodeAddress {
    pub fn public(region: impl Into<String>, allocated: AllocatedAddress) -> Self {
        Self {
            region: region.into(),
            ip: allocated.ip,
            allocation_id: Some(allocated.allocation_id),
        }
    }

    pub fn private(region: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ip: ip.into(),
            allocation_id: None,
        }
    }

    /// Single-host CIDR form, as used in ingress rules.
    pub fn cidr(&self) -> String {
        format!("{}/32", self.ip)
    }
}

/// A freshly reserved public address, as returned by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatedAddress {
    pub ip: String,
    pub allocation_id: String,
}

/// Subnet in one availability zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub region: String,
    pub availability_zone: String,
    pub cidr_block: String,
    /// Value of the Name tag, if the subnet carries one.
    pub name: Option<String>,
}

/// Machine image to boot nodes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineImage {
    pub id: String,
    pub name: String,
    pub block_devices: Vec<ImageBlockDevice>,
}

/// Block-device mapping declared by an image.
///
/// `volume` is `None` for instance-store (ephemeral) backed entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBlockDevice {
    pub device_name: String,
    pub volume: Option<VolumeSpec>,
}

/// Parameters of a persistent (network) volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub snapshot_id: Option<String>,
    pub size_gb: Option<i32>,
    pub volume_type: Option<String>,
    pub iops: Option<i32>,
    pub encrypted: Option<bool>,
    pub delete_on_termination: Option<bool>,
}

/// Block-device entry of a launch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockDevice {
    /// Attach a persistent volume at the given device path.
    Volume { device_name: String, volume: VolumeSpec },
    /// Suppress a device the image would otherwise attach.
    NoDevice { device_name: String },
}

impl BlockDevice {
    pub fn device_name(&self) -> &str {
        match self {
            BlockDevice::Volume { device_name, .. } => device_name,
            BlockDevice::NoDevice { device_name } => device_name,
        }
    }
}

/// One ingress rule of a security group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngressRule {
    /// Allow TCP on `port` from a CIDR range.
    Tcp { port: u16, cidr: String },
    /// Allow TCP on `port` from members of another group.
    TcpFromGroup { port: u16, group_id: String },
    /// Allow all protocols from members of a group.
    AllFromGroup { group_id: String },
}

/// Everything the provider needs to boot one instance.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: String,
    pub security_group_id: String,
    /// Raw user data; providers encode it as their API requires.
    pub user_data: String,
    pub block_devices: Vec<BlockDevice>,
    /// Explicit private address, for internal-subnet deployments only.
    pub private_ip: Option<String>,
    pub disable_api_termination: bool,
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Pending,
    Running,
    Other(String),
}

impl InstanceState {
    pub fn is_pending(&self) -> bool {
        matches!(self, InstanceState::Pending)
    }
}

/// Volume attached to a running instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachedVolume {
    pub device_name: String,
    pub volume_id: String,
}

/// Instance as described by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub state: InstanceState,
    pub volumes: Vec<AttachedVolume>,
}
