//! In-memory provider for unit tests
//!
//! Records every mutating call in order, serves a configurable inventory
//! of images and subnets, and injects failures at chosen call counts.

use crate::userdata::{BootConfigBuilder, BootPayload, USER_DATA_HEADER};
use async_trait::async_trait;
use ringleader_cloud::{
    AllocatedAddress, AttachedVolume, BlockDevice, CloudError, ImageBlockDevice, IngressRule,
    Instance, InstanceState, LaunchSpec, MachineImage, NodeAddress, NodeProvider, Result, Subnet,
    VolumeSpec,
};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    AllocateAddress {
        region: String,
        allocation_id: String,
    },
    ReleaseAddress {
        region: String,
        allocation_id: String,
    },
    AssociateAddress {
        region: String,
        instance_id: String,
        allocation_id: String,
    },
    CreateSecurityGroup {
        region: String,
        name: String,
    },
    AuthorizeIngress {
        region: String,
        group_id: String,
        rules: Vec<IngressRule>,
    },
    DeleteSecurityGroup {
        region: String,
        group_id: String,
    },
    RunInstance {
        region: String,
        private_ip: Option<String>,
    },
    TagResource {
        region: String,
        resource_id: String,
        name: String,
    },
    RegisterAlarm {
        region: String,
        instance_id: String,
    },
}

#[derive(Default)]
struct MockState {
    ops: Vec<Op>,
    subnets: HashMap<String, Vec<Subnet>>,
    images: HashMap<String, MachineImage>,
    in_use: HashSet<String>,
    bastion: Option<String>,
    fail_on: HashMap<String, usize>,
    call_counts: HashMap<String, usize>,
    pending_polls: u32,
    pending_left: HashMap<String, u32>,
    instance_volumes: HashMap<String, Vec<AttachedVolume>>,
    next_id: u32,
}

impl MockState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Count the call and fail if an injection matches.
    fn check_fail(&mut self, op: &str) -> Result<()> {
        let count = {
            let entry = self.call_counts.entry(op.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if self.fail_on.get(op).copied() == Some(count) {
            return Err(CloudError::ApiError(format!("injected {op} failure")));
        }
        Ok(())
    }
}

pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    /// A provider with a default image and two subnets per region.
    pub fn for_regions(regions: &[&str], subnet_prefix: &str) -> Self {
        let provider = Self::new();
        for (index, region) in regions.iter().enumerate() {
            provider.add_default_image(region);
            provider.add_subnet(
                region,
                &format!("{subnet_prefix}{region}-a"),
                &format!("{region}a"),
                &format!("10.{index}.0.0/24"),
            );
            provider.add_subnet(
                region,
                &format!("{subnet_prefix}{region}-b"),
                &format!("{region}b"),
                &format!("10.{index}.1.0/24"),
            );
        }
        provider
    }

    pub fn add_default_image(&self, region: &str) {
        let image = MachineImage {
            id: format!("ami-{region}"),
            name: "container-base-2026.1".to_string(),
            block_devices: vec![
                ImageBlockDevice {
                    device_name: "/dev/xvda".to_string(),
                    volume: Some(VolumeSpec {
                        snapshot_id: Some("snap-root".to_string()),
                        size_gb: Some(16),
                        volume_type: Some("gp3".to_string()),
                        iops: None,
                        encrypted: Some(true),
                        delete_on_termination: Some(true),
                    }),
                },
                ImageBlockDevice {
                    device_name: "/dev/xvdb".to_string(),
                    volume: None,
                },
            ],
        };
        self.state
            .lock()
            .unwrap()
            .images
            .insert(region.to_string(), image);
    }

    pub fn add_subnet(&self, region: &str, name: &str, az: &str, cidr: &str) {
        let mut state = self.state.lock().unwrap();
        let id = format!("subnet-{}", state.next_id());
        state.subnets.entry(region.to_string()).or_default().push(Subnet {
            id,
            region: region.to_string(),
            availability_zone: az.to_string(),
            cidr_block: cidr.to_string(),
            name: Some(name.to_string()),
        });
    }

    pub fn mark_in_use(&self, ip: &str) {
        self.state.lock().unwrap().in_use.insert(ip.to_string());
    }

    pub fn set_bastion(&self, group_id: &str) {
        self.state.lock().unwrap().bastion = Some(group_id.to_string());
    }

    /// How many describes report an instance as pending before it runs.
    pub fn set_pending_polls(&self, polls: u32) {
        self.state.lock().unwrap().pending_polls = polls;
    }

    /// Make the `nth` call of `op` fail (1-based).
    pub fn fail_on(&self, op: &str, nth: usize) {
        self.state.lock().unwrap().fail_on.insert(op.to_string(), nth);
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }

    /// Rule lists passed to authorize calls, in call order.
    pub fn authorized_rules(&self) -> Vec<Vec<IngressRule>> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::AuthorizeIngress { rules, .. } => Some(rules),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl NodeProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn find_latest_image(&self, region: &str, name_pattern: &str) -> Result<MachineImage> {
        let state = self.state.lock().unwrap();
        state
            .images
            .get(region)
            .cloned()
            .ok_or_else(|| CloudError::ImageNotFound {
                region: region.to_string(),
                pattern: name_pattern.to_string(),
            })
    }

    async fn list_subnets(&self, region: &str) -> Result<Vec<Subnet>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .subnets
            .get(region)
            .cloned()
            .unwrap_or_default())
    }

    async fn allocate_address(&self, region: &str) -> Result<AllocatedAddress> {
        let mut state = self.state.lock().unwrap();
        state.check_fail("allocate_address")?;
        let id = state.next_id();
        let allocated = AllocatedAddress {
            ip: format!("198.51.100.{id}"),
            allocation_id: format!("eipalloc-{id}"),
        };
        state.ops.push(Op::AllocateAddress {
            region: region.to_string(),
            allocation_id: allocated.allocation_id.clone(),
        });
        Ok(allocated)
    }

    async fn release_address(&self, region: &str, allocation_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check_fail("release_address")?;
        state.ops.push(Op::ReleaseAddress {
            region: region.to_string(),
            allocation_id: allocation_id.to_string(),
        });
        Ok(())
    }

    async fn associate_address(
        &self,
        region: &str,
        instance_id: &str,
        allocation_id: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check_fail("associate_address")?;
        state.ops.push(Op::AssociateAddress {
            region: region.to_string(),
            instance_id: instance_id.to_string(),
            allocation_id: allocation_id.to_string(),
        });
        Ok(())
    }

    async fn address_in_use(&self, _region: &str, ip: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().in_use.contains(ip))
    }

    async fn create_security_group(
        &self,
        region: &str,
        name: &str,
        _description: &str,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.check_fail("create_security_group")?;
        let group_id = format!("sg-{}", state.next_id());
        state.ops.push(Op::CreateSecurityGroup {
            region: region.to_string(),
            name: name.to_string(),
        });
        Ok(group_id)
    }

    async fn find_security_group(&self, _region: &str, _name: &str) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().bastion.clone())
    }

    async fn authorize_ingress(
        &self,
        region: &str,
        group_id: &str,
        rules: &[IngressRule],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check_fail("authorize_ingress")?;
        state.ops.push(Op::AuthorizeIngress {
            region: region.to_string(),
            group_id: group_id.to_string(),
            rules: rules.to_vec(),
        });
        Ok(())
    }

    async fn delete_security_group(&self, region: &str, group_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check_fail("delete_security_group")?;
        state.ops.push(Op::DeleteSecurityGroup {
            region: region.to_string(),
            group_id: group_id.to_string(),
        });
        Ok(())
    }

    async fn run_instance(&self, region: &str, spec: &LaunchSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.check_fail("run_instance")?;
        let instance_id = format!("i-{}", state.next_id());

        let mut volumes = Vec::new();
        for device in &spec.block_devices {
            if let BlockDevice::Volume { device_name, .. } = device {
                let volume_id = format!("vol-{}", state.next_id());
                volumes.push(AttachedVolume {
                    device_name: device_name.clone(),
                    volume_id,
                });
            }
        }
        let pending = state.pending_polls;
        state.pending_left.insert(instance_id.clone(), pending);
        state.instance_volumes.insert(instance_id.clone(), volumes);
        state.ops.push(Op::RunInstance {
            region: region.to_string(),
            private_ip: spec.private_ip.clone(),
        });
        Ok(instance_id)
    }

    async fn describe_instance(&self, _region: &str, instance_id: &str) -> Result<Instance> {
        let mut state = self.state.lock().unwrap();
        let left = state
            .pending_left
            .get_mut(instance_id)
            .ok_or_else(|| CloudError::ResourceNotFound(instance_id.to_string()))?;
        let instance_state = if *left > 0 {
            *left -= 1;
            InstanceState::Pending
        } else {
            InstanceState::Running
        };
        let volumes = match instance_state {
            // Attached volumes only become visible once the instance has
            // left the pending state.
            InstanceState::Pending => Vec::new(),
            _ => state
                .instance_volumes
                .get(instance_id)
                .cloned()
                .unwrap_or_default(),
        };
        Ok(Instance {
            id: instance_id.to_string(),
            state: instance_state,
            volumes,
        })
    }

    async fn tag_resource(&self, region: &str, resource_id: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check_fail("tag_resource")?;
        state.ops.push(Op::TagResource {
            region: region.to_string(),
            resource_id: resource_id.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn register_recovery_alarm(
        &self,
        region: &str,
        _alarm_name: &str,
        instance_id: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check_fail("register_recovery_alarm")?;
        state.ops.push(Op::RegisterAlarm {
            region: region.to_string(),
            instance_id: instance_id.to_string(),
        });
        Ok(())
    }
}

/// Canned boot payload; orchestrator tests never shell out to keytool or
/// hit a registry.
pub struct StaticBootConfig;

#[async_trait]
impl BootConfigBuilder for StaticBootConfig {
    async fn build(
        &self,
        _options: &crate::options::ClusterOptions,
        _seed_addresses: &HashMap<String, Vec<NodeAddress>>,
    ) -> crate::error::Result<BootPayload> {
        Ok(BootPayload {
            user_data: format!("{USER_DATA_HEADER}\n"),
            admin_password: "hunter2".to_string(),
            runtime_version: "4.1.4".to_string(),
        })
    }
}
