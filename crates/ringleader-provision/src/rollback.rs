//! Compensation log for partial-failure rollback
//!
//! Every resource the run creates is recorded as a typed undo action the
//! moment it exists. On failure the log is replayed in reverse creation
//! order; each action is attempted independently so one failing delete does
//! not stop the rest of the cleanup.

use ringleader_cloud::{CloudError, NodeAddress, NodeProvider};

/// A single compensating action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoAction {
    ReleaseAddress {
        region: String,
        ip: String,
        allocation_id: String,
        /// Set once the address has been bound to an instance. Attached
        /// addresses are left in place; releasing them would yank the
        /// address from under a running node.
        attached: bool,
    },
    DeleteSecurityGroup {
        region: String,
        group_id: String,
    },
}

impl UndoAction {
    pub fn describe(&self) -> String {
        match self {
            UndoAction::ReleaseAddress { region, ip, .. } => {
                format!("release address {ip} in {region}")
            }
            UndoAction::DeleteSecurityGroup { region, group_id } => {
                format!("delete security group {group_id} in {region}")
            }
        }
    }
}

/// A compensation step that itself failed.
#[derive(Debug)]
pub struct RollbackFailure {
    pub action: String,
    pub error: CloudError,
}

impl std::fmt::Display for RollbackFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.action, self.error)
    }
}

/// Ordered log of undo actions for everything the run has created.
///
/// Instances are deliberately absent: rollback only cleans up supporting
/// network and firewall resources, never terminates launched nodes.
#[derive(Debug, Default)]
pub struct CompensationLog {
    actions: Vec<UndoAction>,
}

impl CompensationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reserved address. Private addresses carry no allocation
    /// handle and need no compensation.
    pub fn record_address(&mut self, address: &NodeAddress) {
        if let Some(allocation_id) = &address.allocation_id {
            self.actions.push(UndoAction::ReleaseAddress {
                region: address.region.clone(),
                ip: address.ip.clone(),
                allocation_id: allocation_id.clone(),
                attached: false,
            });
        }
    }

    pub fn record_security_group(&mut self, region: &str, group_id: &str) {
        self.actions.push(UndoAction::DeleteSecurityGroup {
            region: region.to_string(),
            group_id: group_id.to_string(),
        });
    }

    /// Mark an address as bound to an instance, excluding it from release.
    pub fn mark_address_attached(&mut self, attached_allocation_id: &str) {
        for action in &mut self.actions {
            if let UndoAction::ReleaseAddress {
                allocation_id,
                attached,
                ..
            } = action
                && allocation_id == attached_allocation_id
            {
                *attached = true;
            }
        }
    }

    /// Security groups recorded so far, in creation order.
    pub fn security_groups(&self) -> impl Iterator<Item = (&str, &str)> {
        self.actions.iter().filter_map(|action| match action {
            UndoAction::DeleteSecurityGroup { region, group_id } => {
                Some((region.as_str(), group_id.as_str()))
            }
            _ => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Replay the log in reverse creation order. Every action is
    /// attempted; failures are collected and returned, never raised.
    pub async fn rollback(&self, provider: &dyn NodeProvider) -> Vec<RollbackFailure> {
        let mut failures = Vec::new();
        for action in self.actions.iter().rev() {
            match action {
                UndoAction::DeleteSecurityGroup { region, group_id } => {
                    tracing::info!(region, group_id, "cleaning up security group");
                    if let Err(error) = provider.delete_security_group(region, group_id).await {
                        tracing::error!(region, group_id, %error, "failed to delete security group");
                        failures.push(RollbackFailure {
                            action: action.describe(),
                            error,
                        });
                    }
                }
                UndoAction::ReleaseAddress {
                    region,
                    ip,
                    allocation_id,
                    attached,
                } => {
                    if *attached {
                        tracing::info!(
                            region,
                            ip,
                            "address is attached to a running instance, leaving it in place"
                        );
                        continue;
                    }
                    tracing::info!(region, ip, "releasing address");
                    if let Err(error) = provider.release_address(region, allocation_id).await {
                        tracing::error!(region, ip, %error, "failed to release address");
                        failures.push(RollbackFailure {
                            action: action.describe(),
                            error,
                        });
                    }
                }
            }
        }
        failures
    }
}
