//! Convoy Deploy
//!
//! Zero-downtime deployment for the platform's services:
//! - Production readiness validator (image, resources, security, health
//!   config, dependencies, rollback readiness)
//! - Blue/green deployer with gradual traffic shifting, health gating,
//!   and automatic rollback
//! - Load-balancer traffic-split contract
//! - Production monitor aggregating readiness, alerts, and rollouts
//! - Security audit over the active configuration

#![allow(dead_code)]

pub mod audit;
pub mod bluegreen;
pub mod loadbalancer;
pub mod monitor;
pub mod validator;

pub use audit::{audit_config, AuditError, AuditFinding, AuditReport, AuditSeverity};
pub use bluegreen::{
    BlueGreenDeployer, DeployOutcome, DeployPolicy, DeployRecord, DeployResult, DeploymentStatus,
    EnvStatus, ErrorRateProbe, FixedErrorRate, TrafficStep,
};
pub use loadbalancer::{
    LbError, LoadBalancer, MemoryBalancer, SwitchOutcome, UpstreamFileBalancer,
};
pub use monitor::{
    DeploymentHealth, MonitorAlert, ProductionMonitor, ProductionMonitorError, RolloutWatch,
};
pub use validator::{
    CheckResult, DeployRequest, DeploymentValidator, HealthCheckSpec, HostCapacity, ResourceSpec,
    ValidationOutcome,
};
