//! go-api Infrastructure
//!
//! Declarative topology for the go-api deployment:
//! - Isolated network with public-only or public+private subnets
//! - Fargate service behind an internet-facing load balancer
//! - Aurora PostgreSQL serverless datastore with IAM authentication
//! - Event-triggered function and a session-broker bastion
//! - CPU target tracking in production
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        DeploymentConfig                              │
//! │                 (staging / production presets)                       │
//! └──────────────────────────────┬───────────────────────────────────────┘
//!                                │ stack::build
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         ResourceGraph                                │
//! │                                                                      │
//! │  Network ─► Security ─► Datastore ─► Cluster ─► Exposure ─► Service  │
//! │                              │                                 │     │
//! │                              └──────► Bastion        Scaling ◄─┘     │
//! │                                                                      │
//! │  Function (no edges to the service)            Outputs               │
//! └──────────────────────────────┬───────────────────────────────────────┘
//!                                │ template::SynthesizedStack
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │        engine::ProvisioningEngine (CloudFormation via aws CLI)       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod graph;
pub mod resources;
pub mod config;
pub mod network;
pub mod security;
pub mod iam;
pub mod cluster;
pub mod service;
pub mod exposure;
pub mod health;
pub mod datastore;
pub mod function;
pub mod bastion;
pub mod scaling;
pub mod outputs;
pub mod stack;
pub mod template;
pub mod engine;

pub use config::{DeploymentConfig, Environment, SubnetMode};
pub use engine::{CloudFormationEngine, DeployReport, EngineError, ProvisioningEngine};
pub use error::{InfraError, InfraResult};
pub use graph::{Declaration, ResourceGraph, ResourceId, ResourceRef, Token};
pub use health::{simulate_backend, TargetHealth};
pub use resources::ResourceKind;
pub use scaling::ScalingController;
pub use stack::{build, Deployment};
pub use template::{SynthesizedStack, Template};
