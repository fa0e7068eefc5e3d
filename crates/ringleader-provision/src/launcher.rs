//! Instance launching
//!
//! Boots one node per allocated address: sanitized boot volumes plus a
//! dedicated encrypted data volume, Name tags, a bounded wait for the
//! instance to leave the pending state, public-address association where
//! applicable, and an auto-recovery alarm.
//!
//! Side effects are cumulative, not transactional: once the boot request
//! succeeds the instance exists and is billable, whatever happens to the
//! remaining steps. Rollback never terminates instances, so failures past
//! the boot request leave the node running.

use crate::error::{ProvisionError, Result};
use crate::options::ClusterOptions;
use crate::rollback::CompensationLog;
use ringleader_cloud::{
    BlockDevice, Instance, LaunchSpec, MachineImage, NodeAddress, NodeProvider, VolumeSpec,
};
use tokio_util::sync::CancellationToken;

/// Device path of the data volume; the boot configuration mounts it by
/// this name.
pub const DATA_DEVICE: &str = "/dev/xvdf";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Seed,
    Normal,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Seed => write!(f, "seed"),
            NodeRole::Normal => write!(f, "normal"),
        }
    }
}

/// A successfully launched node.
#[derive(Debug, Clone)]
pub struct LaunchedNode {
    pub region: String,
    pub instance_id: String,
    pub ip: String,
    pub role: NodeRole,
}

/// Launches nodes one at a time; ordering and pacing stay with the
/// orchestrator.
pub struct NodeLauncher<'a> {
    pub provider: &'a dyn NodeProvider,
    pub options: &'a ClusterOptions,
    pub cancel: &'a CancellationToken,
}

impl NodeLauncher<'_> {
    #[allow(clippy::too_many_arguments)]
    pub async fn launch(
        &self,
        address: &NodeAddress,
        image: &MachineImage,
        subnet_id: &str,
        security_group_id: &str,
        role: NodeRole,
        user_data: &str,
        log: &mut CompensationLog,
    ) -> Result<LaunchedNode> {
        let region = &address.region;
        tracing::info!(region, ip = %address.ip, %role, "launching node");

        let spec = LaunchSpec {
            image_id: image.id.clone(),
            instance_type: self.options.instance_type.clone(),
            subnet_id: subnet_id.to_string(),
            security_group_id: security_group_id.to_string(),
            user_data: user_data.to_string(),
            block_devices: boot_block_devices(image, self.options),
            private_ip: self.options.internal.then(|| address.ip.clone()),
            disable_api_termination: self.options.termination_protection,
        };

        let instance_id = self.provider.run_instance(region, &spec).await?;
        self.provider
            .tag_resource(region, &instance_id, &self.options.cluster_name)
            .await?;

        // The instance must be out of the pending state before an address
        // can be associated or the attached volume tagged.
        let instance = self.wait_until_started(region, &instance_id).await?;

        if let Some(allocation_id) = &address.allocation_id {
            self.provider
                .associate_address(region, &instance_id, allocation_id)
                .await?;
            log.mark_address_attached(allocation_id);
        }

        if let Some(volume) = instance
            .volumes
            .iter()
            .find(|volume| volume.device_name == DATA_DEVICE)
        {
            self.provider
                .tag_resource(region, &volume.volume_id, &self.options.cluster_name)
                .await?;
        }

        let alarm_name = format!("{}-{}-auto-recover", self.options.cluster_name, instance_id);
        self.provider
            .register_recovery_alarm(region, &alarm_name, &instance_id)
            .await?;

        tracing::info!(region, instance_id, ip = %address.ip, %role, "node launched");
        Ok(LaunchedNode {
            region: region.clone(),
            instance_id,
            ip: address.ip.clone(),
            role,
        })
    }

    async fn wait_until_started(&self, region: &str, instance_id: &str) -> Result<Instance> {
        for _ in 0..self.options.pending_poll_attempts {
            let instance = self.provider.describe_instance(region, instance_id).await?;
            if !instance.state.is_pending() {
                return Ok(instance);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.options.pending_poll_interval) => {}
                _ = self.cancel.cancelled() => return Err(ProvisionError::Interrupted),
            }
        }
        Err(ProvisionError::PendingTimeout {
            instance_id: instance_id.to_string(),
            region: region.to_string(),
            waited_secs: (self.options.pending_poll_interval
                * self.options.pending_poll_attempts)
                .as_secs(),
        })
    }
}

/// Block-device list for the boot request, derived from the image's
/// declared mappings.
///
/// Persistent entries are copied with any inherited `encrypted` attribute
/// stripped: the provider rejects an explicit value on launch even when it
/// matches the snapshot. Instance-store entries are suppressed with a
/// no-device marker since ephemeral storage disables auto-recovery. The
/// dedicated encrypted data volume is appended last at [`DATA_DEVICE`].
pub fn boot_block_devices(image: &MachineImage, options: &ClusterOptions) -> Vec<BlockDevice> {
    let mut devices = Vec::with_capacity(image.block_devices.len() + 1);
    for mapping in &image.block_devices {
        match &mapping.volume {
            Some(volume) => {
                let mut volume = volume.clone();
                volume.encrypted = None;
                devices.push(BlockDevice::Volume {
                    device_name: mapping.device_name.clone(),
                    volume,
                });
            }
            None => devices.push(BlockDevice::NoDevice {
                device_name: mapping.device_name.clone(),
            }),
        }
    }
    devices.push(BlockDevice::Volume {
        device_name: DATA_DEVICE.to_string(),
        volume: data_volume(options),
    });
    devices
}

fn data_volume(options: &ClusterOptions) -> VolumeSpec {
    let iops = matches!(options.volume_type.as_str(), "io1" | "io2")
        .then_some(options.volume_iops);
    VolumeSpec {
        snapshot_id: None,
        size_gb: Some(options.volume_size_gb),
        volume_type: Some(options.volume_type.clone()),
        iops,
        encrypted: Some(true),
        delete_on_termination: Some(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockProvider, Op};
    use ringleader_cloud::ImageBlockDevice;
    use std::time::Duration;

    fn image_with_devices() -> MachineImage {
        MachineImage {
            id: "ami-1234".to_string(),
            name: "container-base-2026.1".to_string(),
            block_devices: vec![
                ImageBlockDevice {
                    device_name: "/dev/xvda".to_string(),
                    volume: Some(VolumeSpec {
                        snapshot_id: Some("snap-root".to_string()),
                        size_gb: Some(16),
                        volume_type: Some("gp3".to_string()),
                        iops: None,
                        encrypted: Some(false),
                        delete_on_termination: Some(true),
                    }),
                },
                ImageBlockDevice {
                    device_name: "/dev/xvdb".to_string(),
                    volume: None,
                },
            ],
        }
    }

    fn options() -> ClusterOptions {
        let mut options = ClusterOptions::new("hamlet", vec!["eu-west-1".to_string()]);
        options.pending_poll_interval = Duration::from_millis(1);
        options
    }

    #[test]
    fn test_boot_devices_strip_inherited_encrypted_flag() {
        let devices = boot_block_devices(&image_with_devices(), &options());

        let root = devices
            .iter()
            .find(|d| d.device_name() == "/dev/xvda")
            .unwrap();
        match root {
            BlockDevice::Volume { volume, .. } => {
                assert_eq!(volume.encrypted, None);
                assert_eq!(volume.snapshot_id.as_deref(), Some("snap-root"));
            }
            BlockDevice::NoDevice { .. } => panic!("root volume suppressed"),
        }
    }

    #[test]
    fn test_boot_devices_suppress_ephemeral_storage() {
        let devices = boot_block_devices(&image_with_devices(), &options());
        assert!(devices.iter().any(|d| matches!(
            d,
            BlockDevice::NoDevice { device_name } if device_name == "/dev/xvdb"
        )));
    }

    #[test]
    fn test_boot_devices_append_one_encrypted_data_volume() {
        let devices = boot_block_devices(&image_with_devices(), &options());

        let data: Vec<&BlockDevice> = devices
            .iter()
            .filter(|d| d.device_name() == DATA_DEVICE)
            .collect();
        assert_eq!(data.len(), 1);
        match data[0] {
            BlockDevice::Volume { volume, .. } => {
                assert_eq!(volume.encrypted, Some(true));
                assert_eq!(volume.delete_on_termination, Some(false));
                assert_eq!(volume.size_gb, Some(8));
                // gp3 volumes take no explicit IOPS.
                assert_eq!(volume.iops, None);
            }
            BlockDevice::NoDevice { .. } => panic!("data volume suppressed"),
        }
    }

    #[test]
    fn test_data_volume_iops_for_provisioned_type() {
        let mut options = options();
        options.volume_type = "io1".to_string();
        options.volume_iops = 400;
        let devices = boot_block_devices(&image_with_devices(), &options);
        let data = devices.iter().find(|d| d.device_name() == DATA_DEVICE);
        assert!(matches!(
            data,
            Some(BlockDevice::Volume { volume, .. }) if volume.iops == Some(400)
        ));
    }

    #[tokio::test]
    async fn test_launch_waits_out_pending_then_tags_and_alarms() {
        let provider = MockProvider::new();
        provider.set_pending_polls(2);
        let options = options();
        let cancel = CancellationToken::new();
        let launcher = NodeLauncher {
            provider: &provider,
            options: &options,
            cancel: &cancel,
        };
        let mut log = CompensationLog::new();

        let address = NodeAddress::private("eu-west-1", "10.0.0.11");
        let node = launcher
            .launch(
                &address,
                &image_with_devices(),
                "subnet-a",
                "sg-1",
                NodeRole::Seed,
                "#container-base-config\n",
                &mut log,
            )
            .await
            .unwrap();

        assert_eq!(node.role, NodeRole::Seed);
        let ops = provider.ops();
        // Instance tag, then (after the wait) data volume tag.
        assert!(ops.contains(&Op::TagResource {
            region: "eu-west-1".to_string(),
            resource_id: node.instance_id.clone(),
            name: "hamlet".to_string(),
        }));
        assert!(ops.iter().any(|op| matches!(
            op,
            Op::TagResource { resource_id, .. } if resource_id.starts_with("vol-")
        )));
        assert!(ops.iter().any(|op| matches!(
            op,
            Op::RegisterAlarm { instance_id, .. } if *instance_id == node.instance_id
        )));
    }

    #[tokio::test]
    async fn test_launch_bounded_pending_wait_times_out() {
        let provider = MockProvider::new();
        provider.set_pending_polls(u32::MAX);
        let mut options = options();
        options.pending_poll_attempts = 3;
        let cancel = CancellationToken::new();
        let launcher = NodeLauncher {
            provider: &provider,
            options: &options,
            cancel: &cancel,
        };
        let mut log = CompensationLog::new();

        let address = NodeAddress::private("eu-west-1", "10.0.0.11");
        let err = launcher
            .launch(
                &address,
                &image_with_devices(),
                "subnet-a",
                "sg-1",
                NodeRole::Normal,
                "",
                &mut log,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::PendingTimeout { .. }));
    }

    #[tokio::test]
    async fn test_public_launch_associates_and_marks_attached() {
        let provider = MockProvider::new();
        let options = options();
        let cancel = CancellationToken::new();
        let launcher = NodeLauncher {
            provider: &provider,
            options: &options,
            cancel: &cancel,
        };

        let address = NodeAddress {
            region: "eu-west-1".to_string(),
            ip: "198.51.100.7".to_string(),
            allocation_id: Some("eipalloc-7".to_string()),
        };
        let mut log = CompensationLog::new();
        log.record_address(&address);

        launcher
            .launch(
                &address,
                &image_with_devices(),
                "subnet-a",
                "sg-1",
                NodeRole::Seed,
                "",
                &mut log,
            )
            .await
            .unwrap();

        assert!(provider.ops().iter().any(|op| matches!(
            op,
            Op::AssociateAddress { allocation_id, .. } if allocation_id == "eipalloc-7"
        )));
        // The attached address must survive rollback.
        let failures = log.rollback(&provider).await;
        assert!(failures.is_empty());
        assert!(!provider
            .ops()
            .iter()
            .any(|op| matches!(op, Op::ReleaseAddress { .. })));
    }

    #[tokio::test]
    async fn test_internal_launch_requests_the_allocated_private_ip() {
        let provider = MockProvider::new();
        let mut options = options();
        options.internal = true;
        let cancel = CancellationToken::new();
        let launcher = NodeLauncher {
            provider: &provider,
            options: &options,
            cancel: &cancel,
        };
        let mut log = CompensationLog::new();

        let address = NodeAddress::private("eu-west-1", "10.0.0.42");
        launcher
            .launch(
                &address,
                &image_with_devices(),
                "subnet-a",
                "sg-1",
                NodeRole::Seed,
                "",
                &mut log,
            )
            .await
            .unwrap();

        assert!(provider.ops().iter().any(|op| matches!(
            op,
            Op::RunInstance { private_ip: Some(ip), .. } if ip == "10.0.0.42"
        )));
    }
}
