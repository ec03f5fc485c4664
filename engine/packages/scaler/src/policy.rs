use async_trait::async_trait;
use serde::Serialize;

use crate::context::ScalingContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScaleUrgency {
	Low,
	Medium,
	High,
	Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScaleUpRecommendation {
	pub server_type: String,
	pub urgency: ScaleUrgency,
	pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScaleDownRecommendation {
	pub node_id: String,
	pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedMigration {
	pub server_id: String,
	pub server_name: String,
	pub from_node: String,
	pub ram_mb: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationPlan {
	pub migrations: Vec<PlannedMigration>,
	pub nodes_to_keep: Vec<String>,
	pub nodes_to_remove: Vec<String>,
	pub node_savings: u32,
	pub estimated_monthly_savings_eur: f64,
	pub reason: String,
}

/// What happened when a consolidation plan was executed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
	pub migrated: u32,
	pub failed: u32,
	/// Set when a failed migration aborted the decommission phase.
	pub decommission_aborted: bool,
	pub nodes_removed: u32,
}

/// Narrow capability the engine uses to run a consolidation plan. The
/// conductor implements it; injecting it after construction keeps the
/// dependency one-way.
#[async_trait]
pub trait MigrationExecutor: Send + Sync {
	async fn execute(&self, plan: &ConsolidationPlan) -> anyhow::Result<MigrationReport>;
}

/// Lets a successful scale-up kick the start queue immediately instead of
/// waiting for the periodic worker.
#[async_trait]
pub trait QueueDriver: Send + Sync {
	async fn process_start_queue(&self);
}

/// A scaling policy. Policies are evaluated in descending priority order
/// and the engine executes at most one recommendation per tick.
#[async_trait]
pub trait ScalingPolicy: Send + Sync {
	fn name(&self) -> &'static str;
	fn priority(&self) -> i32;

	async fn should_scale_up(&self, _ctx: &ScalingContext) -> Option<ScaleUpRecommendation> {
		None
	}

	async fn should_scale_down(&self, _ctx: &ScalingContext) -> Option<ScaleDownRecommendation> {
		None
	}

	async fn should_consolidate(&self, _ctx: &ScalingContext) -> Option<ConsolidationPlan> {
		None
	}
}
