//! Address allocation
//!
//! Public mode reserves provider-managed addresses, one region at a time in
//! parallel. Private mode scans a single region's internal subnets for
//! addresses no running instance holds, walking subnets in the same
//! round-robin order the launcher will use for availability-zone placement.

use crate::error::{ProvisionError, Result};
use crate::options::ClusterOptions;
use futures_util::future::join_all;
use ipnetwork::Ipv4Network;
use ringleader_cloud::{CloudError, NodeAddress, NodeProvider, Subnet};
use std::net::Ipv4Addr;

/// Providers keep the first host addresses of every subnet for their own
/// infrastructure; they are skipped without probing.
const PROVIDER_RESERVED_HOSTS: u32 = 10;

/// One region's public allocation pass.
///
/// Addresses are kept even when the pass failed partway: each reservation
/// is billable from the moment it exists and must reach the rollback log.
pub struct RegionAllocation {
    pub region: String,
    pub addresses: Vec<NodeAddress>,
    pub error: Option<ProvisionError>,
}

/// Reserve `cluster_size` public addresses in every region, one task per
/// region.
pub async fn allocate_public_addresses(
    provider: &dyn NodeProvider,
    options: &ClusterOptions,
) -> Vec<RegionAllocation> {
    let tasks = options.regions.iter().map(|region| async move {
        let mut addresses = Vec::with_capacity(options.cluster_size);
        for _ in 0..options.cluster_size {
            match provider.allocate_address(region).await {
                Ok(allocated) => addresses.push(NodeAddress::public(region.clone(), allocated)),
                Err(error) => {
                    return RegionAllocation {
                        region: region.clone(),
                        addresses,
                        error: Some(error.into()),
                    };
                }
            }
        }
        tracing::info!(region, count = addresses.len(), "allocated public addresses");
        RegionAllocation {
            region: region.clone(),
            addresses,
            error: None,
        }
    });
    join_all(tasks).await
}

/// Find `cluster_size` unused private addresses in one region.
///
/// Node `i` draws from `subnets[i % subnets.len()]`, matching the subnet
/// the launcher will later place that node into. Each candidate is checked
/// against the provider for an instance already holding it; the first free
/// address wins.
pub async fn allocate_private_addresses(
    provider: &dyn NodeProvider,
    options: &ClusterOptions,
    region: &str,
    subnets: &[Subnet],
) -> Result<Vec<NodeAddress>> {
    if subnets.is_empty() {
        return Err(ProvisionError::InvalidOptions(format!(
            "no '{}' subnets found in {region}",
            options.subnet_prefix()
        )));
    }

    let mut scanners = subnets
        .iter()
        .map(|subnet| SubnetScanner::new(subnet, options.subnet_scan_limit))
        .collect::<Result<Vec<_>>>()?;

    let mut addresses = Vec::with_capacity(options.cluster_size);
    for i in 0..options.cluster_size {
        let scanner = &mut scanners[i % subnets.len()];
        if i < subnets.len() {
            scanner.skip_reserved();
        }

        let ip = loop {
            let Some(candidate) = scanner.next_candidate() else {
                return Err(ProvisionError::AddressExhausted {
                    region: region.to_string(),
                    subnet: scanner.subnet_id.clone(),
                    probed: scanner.probed,
                });
            };
            if !provider.address_in_use(region, &candidate.to_string()).await? {
                break candidate;
            }
        };
        addresses.push(NodeAddress::private(region, ip.to_string()));
    }

    tracing::info!(region, count = addresses.len(), "found unused private addresses");
    Ok(addresses)
}

/// Walks the host range of one subnet, remembering how far previous probes
/// got so an address is never handed out twice. The probe count is capped;
/// a saturated subnet surfaces as [`ProvisionError::AddressExhausted`]
/// instead of an unbounded scan.
struct SubnetScanner {
    subnet_id: String,
    base: u32,
    size: u32,
    next_offset: u32,
    probed: usize,
    limit: usize,
}

impl SubnetScanner {
    fn new(subnet: &Subnet, limit: usize) -> Result<Self> {
        let network: Ipv4Network = subnet.cidr_block.parse().map_err(|e| {
            CloudError::InvalidConfig(format!(
                "subnet {} has an unparsable CIDR block '{}': {e}",
                subnet.id, subnet.cidr_block
            ))
        })?;
        Ok(Self {
            subnet_id: subnet.id.clone(),
            base: u32::from(network.network()),
            size: network.size(),
            // Offset 0 is the network address itself.
            next_offset: 1,
            probed: 0,
            limit,
        })
    }

    fn skip_reserved(&mut self) {
        self.next_offset += PROVIDER_RESERVED_HOSTS;
    }

    /// The next host address, or `None` once the range or the probe budget
    /// is exhausted. The last address of the range is the broadcast
    /// address and is never yielded.
    fn next_candidate(&mut self) -> Option<Ipv4Addr> {
        if self.probed >= self.limit || self.next_offset + 1 >= self.size {
            return None;
        }
        let candidate = Ipv4Addr::from(self.base + self.next_offset);
        self.next_offset += 1;
        self.probed += 1;
        Some(candidate)
    }
}
