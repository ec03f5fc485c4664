mod consolidation;
mod context;
mod engine;
mod policy;
mod reactive;

pub use consolidation::ConsolidationPolicy;
pub use context::ScalingContext;
pub use engine::{FleetProvisioner, ScalingEngine};
pub use policy::{
	ConsolidationPlan, MigrationExecutor, MigrationReport, PlannedMigration, QueueDriver,
	ScaleDownRecommendation, ScaleUpRecommendation, ScaleUrgency, ScalingPolicy,
};
pub use reactive::ReactivePolicy;
