pub mod apply;
pub mod diff;
pub mod dn;
pub mod engine;
pub mod mapping;
pub mod scope;

pub use apply::Executor;
pub use diff::{OnMissing, PlanPolicy, Planner};
pub use engine::{EngineOptions, StoreTarget, SyncEngine};
pub use mapping::{ContainerStyle, Mapper};
pub use scope::ScopeRules;
