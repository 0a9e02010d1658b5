//! Convoy Core
//!
//! Shared foundation for the Convoy control plane:
//! - Static service registry (names, ports, runtime dependencies)
//! - Environment-scoped configuration store with atomic reload
//! - Error taxonomy shared across the platform
//! - Capability seams: clock, secret provider, external command runner
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         CONVOY CORE                           │
//! │                                                               │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐    │
//! │  │   Service   │  │   Config    │  │   Capability Seams  │    │
//! │  │   Registry  │  │   Store     │  │  Clock | Secrets |  │    │
//! │  │             │  │ (arc-swap)  │  │  CommandRunner      │    │
//! │  └──────┬──────┘  └──────┬──────┘  └──────────┬──────────┘    │
//! │         │                │                    │               │
//! │         └────────────────┴────────────────────┘               │
//! │                          │                                    │
//! │                          ▼                                    │
//! │         compose · build · metrics · backup · deploy           │
//! └───────────────────────────────────────────────────────────────┘
//! ```

#![allow(dead_code)]

pub mod clock;
pub mod config;
pub mod error;
pub mod registry;
pub mod runner;
pub mod secrets;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigStore, Environment, PlatformConfig};
pub use error::{CoreError, CoreResult, ValidationError};
pub use registry::{Service, ServiceKind, ServiceRegistry};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner, ScriptedRunner};
pub use secrets::{MapSecrets, ProcessEnvSecrets, SecretProvider};
