//! AWS provider implementation

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::error::{DisplayErrorContext, SdkError};
use aws_sdk_ec2::types::{
    BlockDeviceMapping, DomainType, EbsBlockDevice, Filter, InstanceStateName, InstanceType,
    IpPermission, IpRange, Tag, UserIdGroupPair, VolumeType,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ringleader_cloud::{
    AllocatedAddress, AttachedVolume, BlockDevice, CloudError, ImageBlockDevice, IngressRule,
    Instance, InstanceState, LaunchSpec, MachineImage, NodeProvider, Result, Subnet, VolumeSpec,
};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// AWS provider
///
/// Region-scoped EC2 and CloudWatch clients, created on first use and
/// cached for the rest of the process.
pub struct AwsNodeProvider {
    clients: Mutex<HashMap<String, RegionClients>>,
}

#[derive(Clone)]
struct RegionClients {
    ec2: aws_sdk_ec2::Client,
    cloudwatch: aws_sdk_cloudwatch::Client,
}

impl AwsNodeProvider {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn clients(&self, region: &str) -> RegionClients {
        let mut cache = self.clients.lock().await;
        if let Some(clients) = cache.get(region) {
            return clients.clone();
        }
        tracing::debug!(region, "creating AWS clients");
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        let clients = RegionClients {
            ec2: aws_sdk_ec2::Client::new(&config),
            cloudwatch: aws_sdk_cloudwatch::Client::new(&config),
        };
        cache.insert(region.to_string(), clients.clone());
        clients
    }
}

impl Default for AwsNodeProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn api_error<E>(err: SdkError<E>) -> CloudError
where
    SdkError<E>: std::error::Error + Send + Sync + 'static,
{
    CloudError::ApiError(DisplayErrorContext(err).to_string())
}

#[async_trait]
impl NodeProvider for AwsNodeProvider {
    fn name(&self) -> &str {
        "aws"
    }

    async fn find_latest_image(&self, region: &str, name_pattern: &str) -> Result<MachineImage> {
        let clients = self.clients(region).await;
        let resp = clients
            .ec2
            .describe_images()
            .filters(Filter::builder().name("name").values(name_pattern).build())
            .filters(Filter::builder().name("is-public").values("false").build())
            .filters(Filter::builder().name("state").values("available").build())
            .filters(
                Filter::builder()
                    .name("root-device-type")
                    .values("ebs")
                    .build(),
            )
            .send()
            .await
            .map_err(api_error)?;

        // Image names embed their build date; the lexically largest name
        // is the most recent build.
        let mut images: Vec<_> = resp.images().to_vec();
        images.sort_by(|a, b| a.name().cmp(&b.name()));
        let image = images.pop().ok_or_else(|| CloudError::ImageNotFound {
            region: region.to_string(),
            pattern: name_pattern.to_string(),
        })?;

        let block_devices = image
            .block_device_mappings()
            .iter()
            .map(|mapping| ImageBlockDevice {
                device_name: mapping.device_name().unwrap_or_default().to_string(),
                volume: mapping.ebs().map(|ebs| VolumeSpec {
                    snapshot_id: ebs.snapshot_id().map(str::to_string),
                    size_gb: ebs.volume_size(),
                    volume_type: ebs.volume_type().map(|t| t.as_str().to_string()),
                    iops: ebs.iops(),
                    encrypted: ebs.encrypted(),
                    delete_on_termination: ebs.delete_on_termination(),
                }),
            })
            .collect();

        Ok(MachineImage {
            id: image.image_id().unwrap_or_default().to_string(),
            name: image.name().unwrap_or_default().to_string(),
            block_devices,
        })
    }

    async fn list_subnets(&self, region: &str) -> Result<Vec<Subnet>> {
        let clients = self.clients(region).await;
        let resp = clients
            .ec2
            .describe_subnets()
            .send()
            .await
            .map_err(api_error)?;

        Ok(resp
            .subnets()
            .iter()
            .map(|subnet| Subnet {
                id: subnet.subnet_id().unwrap_or_default().to_string(),
                region: region.to_string(),
                availability_zone: subnet.availability_zone().unwrap_or_default().to_string(),
                cidr_block: subnet.cidr_block().unwrap_or_default().to_string(),
                name: subnet
                    .tags()
                    .iter()
                    .find(|tag| tag.key() == Some("Name"))
                    .and_then(|tag| tag.value())
                    .map(str::to_string),
            })
            .collect())
    }

    async fn allocate_address(&self, region: &str) -> Result<AllocatedAddress> {
        let clients = self.clients(region).await;
        let resp = clients
            .ec2
            .allocate_address()
            .domain(DomainType::Vpc)
            .send()
            .await
            .map_err(api_error)?;

        let ip = resp.public_ip().ok_or_else(|| {
            CloudError::ApiError("allocate-address response carried no public ip".to_string())
        })?;
        let allocation_id = resp.allocation_id().ok_or_else(|| {
            CloudError::ApiError("allocate-address response carried no allocation id".to_string())
        })?;
        tracing::debug!(region, ip, "allocated public address");
        Ok(AllocatedAddress {
            ip: ip.to_string(),
            allocation_id: allocation_id.to_string(),
        })
    }

    async fn release_address(&self, region: &str, allocation_id: &str) -> Result<()> {
        let clients = self.clients(region).await;
        clients
            .ec2
            .release_address()
            .allocation_id(allocation_id)
            .send()
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn associate_address(
        &self,
        region: &str,
        instance_id: &str,
        allocation_id: &str,
    ) -> Result<()> {
        let clients = self.clients(region).await;
        clients
            .ec2
            .associate_address()
            .instance_id(instance_id)
            .allocation_id(allocation_id)
            .send()
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn address_in_use(&self, region: &str, ip: &str) -> Result<bool> {
        let clients = self.clients(region).await;
        let resp = clients
            .ec2
            .describe_instances()
            .filters(
                Filter::builder()
                    .name("private-ip-address")
                    .values(ip)
                    .build(),
            )
            .send()
            .await
            .map_err(api_error)?;
        Ok(!resp.reservations().is_empty())
    }

    async fn create_security_group(
        &self,
        region: &str,
        name: &str,
        description: &str,
    ) -> Result<String> {
        let clients = self.clients(region).await;
        let vpcs = clients
            .ec2
            .describe_vpcs()
            .send()
            .await
            .map_err(api_error)?;
        // TODO: support more than one VPC per region
        let vpc_id = vpcs
            .vpcs()
            .first()
            .and_then(|vpc| vpc.vpc_id())
            .ok_or_else(|| CloudError::ResourceNotFound(format!("no VPC in {region}")))?;

        let resp = clients
            .ec2
            .create_security_group()
            .group_name(name)
            .vpc_id(vpc_id)
            .description(description)
            .send()
            .await
            .map_err(api_error)?;
        resp.group_id().map(str::to_string).ok_or_else(|| {
            CloudError::ApiError("create-security-group response carried no group id".to_string())
        })
    }

    async fn find_security_group(&self, region: &str, name: &str) -> Result<Option<String>> {
        let clients = self.clients(region).await;
        let resp = clients
            .ec2
            .describe_security_groups()
            .filters(Filter::builder().name("group-name").values(name).build())
            .send()
            .await
            .map_err(api_error)?;
        Ok(resp
            .security_groups()
            .first()
            .and_then(|group| group.group_id())
            .map(str::to_string))
    }

    async fn authorize_ingress(
        &self,
        region: &str,
        group_id: &str,
        rules: &[IngressRule],
    ) -> Result<()> {
        let clients = self.clients(region).await;
        let permissions: Vec<IpPermission> = rules.iter().map(ip_permission).collect();
        clients
            .ec2
            .authorize_security_group_ingress()
            .group_id(group_id)
            .set_ip_permissions(Some(permissions))
            .send()
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn delete_security_group(&self, region: &str, group_id: &str) -> Result<()> {
        let clients = self.clients(region).await;
        clients
            .ec2
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn run_instance(&self, region: &str, spec: &LaunchSpec) -> Result<String> {
        let clients = self.clients(region).await;
        let block_devices: Vec<BlockDeviceMapping> =
            spec.block_devices.iter().map(block_device_mapping).collect();

        let mut request = clients
            .ec2
            .run_instances()
            .image_id(&spec.image_id)
            .min_count(1)
            .max_count(1)
            .security_group_ids(&spec.security_group_id)
            .user_data(BASE64.encode(spec.user_data.as_bytes()))
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .subnet_id(&spec.subnet_id)
            .set_block_device_mappings(Some(block_devices))
            .disable_api_termination(spec.disable_api_termination);
        if let Some(private_ip) = &spec.private_ip {
            request = request.private_ip_address(private_ip);
        }

        let resp = request.send().await.map_err(api_error)?;
        resp.instances()
            .first()
            .and_then(|instance| instance.instance_id())
            .map(str::to_string)
            .ok_or_else(|| {
                CloudError::ApiError("run-instances response carried no instance".to_string())
            })
    }

    async fn describe_instance(&self, region: &str, instance_id: &str) -> Result<Instance> {
        let clients = self.clients(region).await;
        let resp = clients
            .ec2
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(api_error)?;

        let instance = resp
            .reservations()
            .first()
            .and_then(|reservation| reservation.instances().first())
            .ok_or_else(|| CloudError::ResourceNotFound(instance_id.to_string()))?;

        let state = match instance.state().and_then(|state| state.name()) {
            Some(InstanceStateName::Pending) => InstanceState::Pending,
            Some(InstanceStateName::Running) => InstanceState::Running,
            Some(other) => InstanceState::Other(other.as_str().to_string()),
            None => InstanceState::Other("unknown".to_string()),
        };

        let volumes = instance
            .block_device_mappings()
            .iter()
            .filter_map(|mapping| {
                let device_name = mapping.device_name()?;
                let volume_id = mapping.ebs().and_then(|ebs| ebs.volume_id())?;
                Some(AttachedVolume {
                    device_name: device_name.to_string(),
                    volume_id: volume_id.to_string(),
                })
            })
            .collect();

        Ok(Instance {
            id: instance_id.to_string(),
            state,
            volumes,
        })
    }

    async fn tag_resource(&self, region: &str, resource_id: &str, name: &str) -> Result<()> {
        let clients = self.clients(region).await;
        clients
            .ec2
            .create_tags()
            .resources(resource_id)
            .tags(Tag::builder().key("Name").value(name).build())
            .send()
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn register_recovery_alarm(
        &self,
        region: &str,
        alarm_name: &str,
        instance_id: &str,
    ) -> Result<()> {
        use aws_sdk_cloudwatch::types::{ComparisonOperator, Dimension, Statistic};

        let clients = self.clients(region).await;
        let dimension = Dimension::builder()
            .name("InstanceId")
            .value(instance_id)
            .build()
            .map_err(|e| CloudError::InvalidConfig(e.to_string()))?;
        clients
            .cloudwatch
            .put_metric_alarm()
            .alarm_name(alarm_name)
            .alarm_actions(format!("arn:aws:automate:{region}:ec2:recover"))
            .metric_name("StatusCheckFailed_System")
            .namespace("AWS/EC2")
            .statistic(Statistic::Minimum)
            .dimensions(dimension)
            .period(60)
            .evaluation_periods(2)
            .threshold(0.0)
            .comparison_operator(ComparisonOperator::GreaterThanThreshold)
            .send()
            .await
            .map_err(api_error)?;
        Ok(())
    }
}

fn ip_permission(rule: &IngressRule) -> IpPermission {
    match rule {
        IngressRule::Tcp { port, cidr } => IpPermission::builder()
            .ip_protocol("tcp")
            .from_port(i32::from(*port))
            .to_port(i32::from(*port))
            .ip_ranges(IpRange::builder().cidr_ip(cidr).build())
            .build(),
        IngressRule::TcpFromGroup { port, group_id } => IpPermission::builder()
            .ip_protocol("tcp")
            .from_port(i32::from(*port))
            .to_port(i32::from(*port))
            .user_id_group_pairs(UserIdGroupPair::builder().group_id(group_id).build())
            .build(),
        IngressRule::AllFromGroup { group_id } => IpPermission::builder()
            .ip_protocol("-1")
            .user_id_group_pairs(UserIdGroupPair::builder().group_id(group_id).build())
            .build(),
    }
}

fn block_device_mapping(device: &BlockDevice) -> BlockDeviceMapping {
    match device {
        BlockDevice::Volume {
            device_name,
            volume,
        } => {
            let mut ebs = EbsBlockDevice::builder();
            if let Some(snapshot_id) = &volume.snapshot_id {
                ebs = ebs.snapshot_id(snapshot_id);
            }
            if let Some(size_gb) = volume.size_gb {
                ebs = ebs.volume_size(size_gb);
            }
            if let Some(volume_type) = &volume.volume_type {
                ebs = ebs.volume_type(VolumeType::from(volume_type.as_str()));
            }
            if let Some(iops) = volume.iops {
                ebs = ebs.iops(iops);
            }
            if let Some(encrypted) = volume.encrypted {
                ebs = ebs.encrypted(encrypted);
            }
            if let Some(delete_on_termination) = volume.delete_on_termination {
                ebs = ebs.delete_on_termination(delete_on_termination);
            }
            BlockDeviceMapping::builder()
                .device_name(device_name)
                .ebs(ebs.build())
                .build()
        }
        BlockDevice::NoDevice { device_name } => BlockDeviceMapping::builder()
            .device_name(device_name)
            .no_device("")
            .build(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_permission_for_cidr_rule() {
        let permission = ip_permission(&IngressRule::Tcp {
            port: 7001,
            cidr: "198.51.100.1/32".to_string(),
        });
        assert_eq!(permission.ip_protocol(), Some("tcp"));
        assert_eq!(permission.from_port(), Some(7001));
        assert_eq!(permission.to_port(), Some(7001));
        assert_eq!(
            permission.ip_ranges().first().and_then(|r| r.cidr_ip()),
            Some("198.51.100.1/32")
        );
    }

    #[test]
    fn test_ip_permission_for_group_rules() {
        let all = ip_permission(&IngressRule::AllFromGroup {
            group_id: "sg-1".to_string(),
        });
        assert_eq!(all.ip_protocol(), Some("-1"));
        assert_eq!(
            all.user_id_group_pairs().first().and_then(|p| p.group_id()),
            Some("sg-1")
        );

        let ssh = ip_permission(&IngressRule::TcpFromGroup {
            port: 22,
            group_id: "sg-bastion".to_string(),
        });
        assert_eq!(ssh.from_port(), Some(22));
    }

    #[test]
    fn test_block_device_mapping_no_device_marker() {
        let mapping = block_device_mapping(&BlockDevice::NoDevice {
            device_name: "/dev/xvdb".to_string(),
        });
        assert_eq!(mapping.device_name(), Some("/dev/xvdb"));
        assert_eq!(mapping.no_device(), Some(""));
        assert!(mapping.ebs().is_none());
    }

    #[test]
    fn test_block_device_mapping_skips_unset_fields() {
        let mapping = block_device_mapping(&BlockDevice::Volume {
            device_name: "/dev/xvdf".to_string(),
            volume: VolumeSpec {
                snapshot_id: None,
                size_gb: Some(8),
                volume_type: Some("gp3".to_string()),
                iops: None,
                encrypted: Some(true),
                delete_on_termination: Some(false),
            },
        });
        let ebs = mapping.ebs().unwrap();
        assert_eq!(ebs.snapshot_id(), None);
        assert_eq!(ebs.volume_size(), Some(8));
        assert_eq!(ebs.encrypted(), Some(true));
        assert_eq!(ebs.iops(), None);
    }
}
