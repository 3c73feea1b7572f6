//! Core orchestration engine: durable workflow execution, quota
//! governance, model routing, tier resolution, and skill evolution. No
//! module here talks to an LLM API, a dashboard, or the OS signal table
//! directly; those live outside the core.

pub mod config;
pub mod domain;
pub mod error;
pub mod evolution;
pub mod executor;
pub mod governor;
pub mod model_caller;
pub mod router;
pub mod shutdown;
pub mod tier;

pub use config::Config;
pub use error::{CoreError, Result};
pub use evolution::EvolutionEngine;
pub use executor::Executor;
pub use governor::Governor;
pub use model_caller::ModelCaller;
pub use router::Router;
pub use shutdown::ShutdownCoordinator;
pub use tier::TierResolver;
