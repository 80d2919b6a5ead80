//! # tierlab-core
//!
//! Topology model and lifecycle orchestration for tierlab scenarios.
//!
//! A scenario is a set of backend servers behind a load-balancing router,
//! connected by isolated virtual networks. This crate turns a JSON
//! configuration into a validated [`Topology`] and drives it through
//! define, start, stop and undefine on top of the substrate layer in
//! `tierlab-vm`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      tierlab-core                        │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  TopologyConfig ──build_topology()──▶ Topology           │
//! │                                          │               │
//! │                                          ▼               │
//! │  ┌──────────────────┐  plan()   ┌──────────────────┐     │
//! │  │  Orchestrator    │──────────▶│  Vec<Step>       │     │
//! │  │  - execute()     │           └──────────────────┘     │
//! │  │  - reconcile()   │                                    │
//! │  └──────────────────┘                                    │
//! │     │          │    ▲                                    │
//! │     │          │    │ LifecycleState in / out            │
//! │     │          │  ┌─┴────────────────┐                   │
//! │     │          │  │  StateStore      │ (JSON cache)      │
//! │     │          │  └──────────────────┘                   │
//! └─────┼──────────┼─────────────────────────────────────────┘
//!       ▼          ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │  tierlab-vm: ResourceProvider        ImageManager        │
//! │             (virsh + ovs-vsctl)      (qemu-img)          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use tierlab_core::{
//!     build_topology, LifecycleCommand, Orchestrator, OrchestratorConfig, StateStore,
//!     TopologyConfig,
//! };
//! use tierlab_vm::{ImageLayout, ImageManager, QemuImg, VirshConfig, VirshProvider};
//!
//! # async fn example() -> tierlab_core::Result<()> {
//! let topology = build_topology(&TopologyConfig::from_file("tierlab.json")?)?;
//!
//! let orchestrator = Orchestrator::new(
//!     VirshProvider::new(VirshConfig::default()),
//!     ImageManager::new(QemuImg::new(), ImageLayout::new("cdps-vm-base.qcow2", "images")),
//!     OrchestratorConfig::default(),
//! );
//!
//! let store = StateStore::new(".tierlab-state.json");
//! let run = orchestrator
//!     .execute(LifecycleCommand::Define, &topology, store.load())
//!     .await;
//! store.save(&run.state)?;
//! run.report.into_result()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Deterministic topologies**: the same configuration always yields the same resources
//! - **Idempotent commands**: every step probes first and only changes what is missing
//! - **Resumable failures**: a failed command stops cleanly and can be re-run
//! - **State cache**: atomic JSON cache, always reconstructible by probing

mod command;
mod config;
mod error;
mod orchestrator;
mod report;
mod state;
mod topology;

pub use command::LifecycleCommand;
pub use config::{OrchestratorConfig, OrchestratorConfigBuilder};
pub use error::{CoreError, Result};
pub use orchestrator::{Execution, Orchestrator, Step};
pub use report::{CommandReport, Outcome, StepOutcome};
pub use state::{LifecycleState, StateStore};
pub use topology::{
    build_topology, LogLevel, Topology, TopologyConfig, MAX_BACKENDS, MIN_BACKENDS, ROUTER_ID,
    UPLINK_ID,
};
