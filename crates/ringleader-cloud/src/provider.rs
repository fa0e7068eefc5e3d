//! Node provider trait definition

use crate::error::Result;
use crate::model::{
    AllocatedAddress, IngressRule, Instance, LaunchSpec, MachineImage, Subnet,
};
use async_trait::async_trait;

/// Cloud provider abstraction trait
///
/// Every operation is scoped to a single region; the provider offers no
/// cross-region atomicity, which is exactly why the orchestrator keeps its
/// own compensation log. Each call may fail with a provider error that the
/// caller treats as fatal for the current run, with one documented
/// exception: [`NodeProvider::find_security_group`] returning `Ok(None)`
/// when a group is simply absent.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    /// Returns the provider name (e.g., "aws")
    fn name(&self) -> &str;

    /// Find the most recently named private, available, disk-backed image
    /// matching `name_pattern`.
    async fn find_latest_image(&self, region: &str, name_pattern: &str) -> Result<MachineImage>;

    /// List all subnets of the region, unfiltered.
    async fn list_subnets(&self, region: &str) -> Result<Vec<Subnet>>;

    /// Reserve one provider-managed public address.
    async fn allocate_address(&self, region: &str) -> Result<AllocatedAddress>;

    /// Release a previously reserved public address.
    async fn release_address(&self, region: &str, allocation_id: &str) -> Result<()>;

    /// Bind a reserved public address to a running instance.
    async fn associate_address(
        &self,
        region: &str,
        instance_id: &str,
        allocation_id: &str,
    ) -> Result<()>;

    /// Whether any instance in the region already holds `ip` as its
    /// private address.
    async fn address_in_use(&self, region: &str, ip: &str) -> Result<bool>;

    /// Create a security group named `name`. Fails if a group with that
    /// name already exists; callers rely on the collision being loud.
    async fn create_security_group(
        &self,
        region: &str,
        name: &str,
        description: &str,
    ) -> Result<String>;

    /// Look up a security group by name. `Ok(None)` when absent.
    async fn find_security_group(&self, region: &str, name: &str) -> Result<Option<String>>;

    /// Apply all ingress rules to a group in one authorization call.
    async fn authorize_ingress(
        &self,
        region: &str,
        group_id: &str,
        rules: &[IngressRule],
    ) -> Result<()>;

    /// Delete a security group.
    async fn delete_security_group(&self, region: &str, group_id: &str) -> Result<()>;

    /// Boot exactly one instance and return its id.
    async fn run_instance(&self, region: &str, spec: &LaunchSpec) -> Result<String>;

    /// Describe a single instance.
    async fn describe_instance(&self, region: &str, instance_id: &str) -> Result<Instance>;

    /// Set the Name tag on any taggable resource.
    async fn tag_resource(&self, region: &str, resource_id: &str, name: &str) -> Result<()>;

    /// Register an alarm that triggers automatic recovery of the instance
    /// after two consecutive failed 1-minute system status checks.
    async fn register_recovery_alarm(
        &self,
        region: &str,
        alarm_name: &str,
        instance_id: &str,
    ) -> Result<()>;
}
