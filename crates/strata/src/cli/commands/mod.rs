//! CLI commands

mod cache;
mod plan;
mod run;

pub use cache::CacheCommand;
pub use plan::PlanCommand;
pub use run::RunCommand;
