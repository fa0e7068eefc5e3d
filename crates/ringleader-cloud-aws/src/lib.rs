//! AWS provider for Ringleader
//!
//! Implements the [`ringleader_cloud::NodeProvider`] interface on the AWS
//! SDK: EC2 for addresses, subnets, security groups and instances, and
//! CloudWatch for the auto-recovery alarms. Clients are created lazily,
//! one pair per region, from the ambient credential chain.

pub mod provider;

pub use provider::AwsNodeProvider;
