use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;
use conductor_events::{EventPublisher, kind};
use conductor_registry::{ContainerRegistry, NodeRegistry, StartQueue};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{
	context::ScalingContext,
	policy::{MigrationExecutor, QueueDriver, ScalingPolicy},
};

/// Narrow provisioning capability the engine executes decisions through.
#[async_trait]
pub trait FleetProvisioner: Send + Sync {
	/// Provisions one VM and returns the registered node id.
	async fn provision(&self, server_type: &str) -> anyhow::Result<String>;
	async fn decommission(
		&self,
		node_id: &str,
		decided_by: &str,
		reason: &str,
	) -> anyhow::Result<()>;
	/// True while a placeholder or initializing node exists.
	fn in_flight(&self) -> bool;
}

#[async_trait]
impl FleetProvisioner for conductor_provision::Provisioner {
	async fn provision(&self, server_type: &str) -> anyhow::Result<String> {
		self.provision_node(server_type).await.map(|n| n.id)
	}

	async fn decommission(
		&self,
		node_id: &str,
		decided_by: &str,
		reason: &str,
	) -> anyhow::Result<()> {
		self.decommission_node(node_id, decided_by, reason)
			.await
			.map_err(Into::into)
	}

	fn in_flight(&self) -> bool {
		self.provisioning_in_flight()
	}
}

/// Evaluates registered policies on a periodic tick and dispatches at most
/// one action per tick, in descending policy priority.
pub struct ScalingEngine {
	nodes: Arc<NodeRegistry>,
	containers: Arc<ContainerRegistry>,
	queue: Arc<StartQueue>,
	provisioner: Arc<dyn FleetProvisioner>,
	events: Arc<dyn EventPublisher>,
	cfg: conductor_config::Config,
	policies: RwLock<Vec<Arc<dyn ScalingPolicy>>>,
	// Injected after construction; see the migration orchestrator.
	migrations: OnceLock<Arc<dyn MigrationExecutor>>,
	queue_driver: OnceLock<Arc<dyn QueueDriver>>,
}

impl ScalingEngine {
	pub fn new(
		nodes: Arc<NodeRegistry>,
		containers: Arc<ContainerRegistry>,
		queue: Arc<StartQueue>,
		provisioner: Arc<dyn FleetProvisioner>,
		events: Arc<dyn EventPublisher>,
		cfg: conductor_config::Config,
	) -> Self {
		Self {
			nodes,
			containers,
			queue,
			provisioner,
			events,
			cfg,
			policies: RwLock::new(Vec::new()),
			migrations: OnceLock::new(),
			queue_driver: OnceLock::new(),
		}
	}

	/// Registers a policy, keeping the list sorted by descending priority.
	pub fn register_policy(&self, policy: Arc<dyn ScalingPolicy>) {
		let mut policies = self.policies.write().unwrap();
		policies.push(policy);
		policies.sort_by_key(|p| std::cmp::Reverse(p.priority()));
	}

	pub fn set_migration_executor(&self, executor: Arc<dyn MigrationExecutor>) {
		let _ = self.migrations.set(executor);
	}

	pub fn set_queue_driver(&self, driver: Arc<dyn QueueDriver>) {
		let _ = self.queue_driver.set(driver);
	}

	pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(self.cfg.scaling.interval());
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = interval.tick() => self.evaluate().await,
					_ = shutdown.cancelled() => {
						tracing::debug!("scaling engine stopping");
						return;
					}
				}
			}
		})
	}

	/// Runs one evaluation off the ticker schedule.
	pub fn trigger_immediate_check(self: Arc<Self>) {
		tokio::spawn(async move { self.evaluate().await });
	}

	/// Bootstraps the first worker node. Called by the admission path when
	/// selection reports an empty fleet; the placeholder pattern keeps
	/// concurrent callers from ordering duplicate VMs.
	pub fn ensure_worker_capacity(self: Arc<Self>) {
		if self.provisioner.in_flight() {
			return;
		}

		let server_type = self.cfg.cloud.default_server_type.clone();
		let engine = self;
		tokio::spawn(async move {
			tracing::info!(%server_type, "no worker nodes, provisioning first cloud node");
			match engine.provisioner.provision(&server_type).await {
				Ok(node_id) => {
					tracing::info!(%node_id, "bootstrap node ready");
					if let Some(driver) = engine.queue_driver.get() {
						driver.process_start_queue().await;
					}
				}
				Err(err) => {
					tracing::error!(?err, "failed to provision bootstrap node");
				}
			}
		});
	}

	#[tracing::instrument(skip_all)]
	pub async fn evaluate(&self) {
		let ctx = ScalingContext::build(&self.nodes, self.containers.clone(), &self.queue);
		let policies = self.policies.read().unwrap().clone();

		for policy in &policies {
			if let Some(rec) = policy.should_scale_up(&ctx).await {
				self.events
					.publish(
						kind::SCALING_DECISION,
						json!({
							"policy": policy.name(),
							"action": "scale_up",
							"recommendation": &rec,
						}),
					)
					.await;

				match self.provisioner.provision(&rec.server_type).await {
					Ok(node_id) => {
						self.events
							.publish(
								kind::SCALING_ACTION,
								json!({
									"action": "scale_up",
									"node_id": node_id,
									"urgency": rec.urgency,
								}),
							)
							.await;

						// New capacity: drain the queue right away.
						if let Some(driver) = self.queue_driver.get() {
							driver.process_start_queue().await;
						}
					}
					Err(err) => {
						tracing::error!(policy = policy.name(), ?err, "scale-up failed");
					}
				}
				return;
			}
		}

		for policy in &policies {
			if let Some(rec) = policy.should_scale_down(&ctx).await {
				self.events
					.publish(
						kind::SCALING_DECISION,
						json!({
							"policy": policy.name(),
							"action": "scale_down",
							"recommendation": &rec,
						}),
					)
					.await;

				match self
					.provisioner
					.decommission(&rec.node_id, policy.name(), &rec.reason)
					.await
				{
					Ok(()) => {
						self.events
							.publish(
								kind::SCALING_ACTION,
								json!({ "action": "scale_down", "node_id": rec.node_id }),
							)
							.await;
					}
					Err(err) => {
						tracing::warn!(
							policy = policy.name(),
							node_id = %rec.node_id,
							?err,
							"scale-down failed"
						);
					}
				}
				return;
			}
		}

		for policy in &policies {
			if let Some(plan) = policy.should_consolidate(&ctx).await {
				let Some(executor) = self.migrations.get() else {
					tracing::warn!("consolidation plan but no migration executor wired");
					return;
				};

				self.events
					.publish(
						kind::CONSOLIDATION_STARTED,
						json!({
							"policy": policy.name(),
							"node_savings": plan.node_savings,
							"migrations": plan.migrations.len(),
							"reason": &plan.reason,
						}),
					)
					.await;

				match executor.execute(&plan).await {
					Ok(report) => {
						self.events
							.publish(kind::CONSOLIDATION_COMPLETED, json!({ "report": report }))
							.await;
					}
					Err(err) => {
						tracing::error!(policy = policy.name(), ?err, "consolidation failed");
					}
				}
				return;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		Mutex,
		atomic::{AtomicBool, AtomicUsize, Ordering},
	};

	use conductor_events::NoopPublisher;
	use conductor_types::{HealthStatus, Node, NodeKind};

	use super::*;
	use crate::policy::{
		ConsolidationPlan, MigrationReport, ScaleDownRecommendation, ScaleUpRecommendation,
		ScaleUrgency,
	};

	#[derive(Default)]
	struct MockProvisioner {
		provisioned: Mutex<Vec<String>>,
		decommissioned: Mutex<Vec<String>>,
	}

	#[async_trait]
	impl FleetProvisioner for MockProvisioner {
		async fn provision(&self, server_type: &str) -> anyhow::Result<String> {
			self.provisioned.lock().unwrap().push(server_type.to_string());
			Ok("cloud-new".to_string())
		}

		async fn decommission(
			&self,
			node_id: &str,
			_decided_by: &str,
			_reason: &str,
		) -> anyhow::Result<()> {
			self.decommissioned.lock().unwrap().push(node_id.to_string());
			Ok(())
		}

		fn in_flight(&self) -> bool {
			false
		}
	}

	struct StaticPolicy {
		priority: i32,
		up: Option<ScaleUpRecommendation>,
		down: Option<ScaleDownRecommendation>,
		asked: AtomicUsize,
	}

	impl StaticPolicy {
		fn up(priority: i32) -> Self {
			Self {
				priority,
				up: Some(ScaleUpRecommendation {
					server_type: "cx32".into(),
					urgency: ScaleUrgency::Medium,
					reason: "test".into(),
				}),
				down: None,
				asked: AtomicUsize::new(0),
			}
		}

		fn down(priority: i32, node_id: &str) -> Self {
			Self {
				priority,
				up: None,
				down: Some(ScaleDownRecommendation {
					node_id: node_id.into(),
					reason: "test".into(),
				}),
				asked: AtomicUsize::new(0),
			}
		}
	}

	#[async_trait]
	impl ScalingPolicy for StaticPolicy {
		fn name(&self) -> &'static str {
			"static"
		}

		fn priority(&self) -> i32 {
			self.priority
		}

		async fn should_scale_up(&self, _ctx: &ScalingContext) -> Option<ScaleUpRecommendation> {
			self.asked.fetch_add(1, Ordering::SeqCst);
			self.up.clone()
		}

		async fn should_scale_down(
			&self,
			_ctx: &ScalingContext,
		) -> Option<ScaleDownRecommendation> {
			self.down.clone()
		}
	}

	struct CountingQueueDriver {
		kicked: AtomicBool,
	}

	#[async_trait]
	impl QueueDriver for CountingQueueDriver {
		async fn process_start_queue(&self) {
			self.kicked.store(true, Ordering::SeqCst);
		}
	}

	async fn engine_with(provisioner: Arc<MockProvisioner>) -> Arc<ScalingEngine> {
		let nodes = Arc::new(NodeRegistry::new(Vec::new()));
		let mut n = Node::new("cloud-0", NodeKind::Cloud, 8192, 0.1);
		n.status = HealthStatus::Healthy;
		nodes.register(n).await;
		let containers = Arc::new(ContainerRegistry::new(nodes.clone()));

		Arc::new(ScalingEngine::new(
			nodes,
			containers,
			Arc::new(StartQueue::new()),
			provisioner,
			Arc::new(NoopPublisher),
			conductor_config::Config::default(),
		))
	}

	#[tokio::test]
	async fn one_action_per_tick_and_priority_order() {
		let provisioner = Arc::new(MockProvisioner::default());
		let engine = engine_with(provisioner.clone()).await;

		let low = Arc::new(StaticPolicy::up(10));
		let high = Arc::new(StaticPolicy::up(100));
		engine.register_policy(low.clone());
		engine.register_policy(high.clone());

		engine.evaluate().await;

		// Only the high-priority recommendation ran; the low one was never
		// consulted because evaluation stops at the first positive answer.
		assert_eq!(provisioner.provisioned.lock().unwrap().len(), 1);
		assert_eq!(high.asked.load(Ordering::SeqCst), 1);
		assert_eq!(low.asked.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn scale_up_kicks_the_queue_driver() {
		let provisioner = Arc::new(MockProvisioner::default());
		let engine = engine_with(provisioner).await;
		let driver = Arc::new(CountingQueueDriver {
			kicked: AtomicBool::new(false),
		});
		engine.set_queue_driver(driver.clone());
		engine.register_policy(Arc::new(StaticPolicy::up(100)));

		engine.evaluate().await;
		assert!(driver.kicked.load(Ordering::SeqCst));
	}

	#[tokio::test]
	async fn scale_down_runs_when_no_scale_up_fires() {
		let provisioner = Arc::new(MockProvisioner::default());
		let engine = engine_with(provisioner.clone()).await;
		engine.register_policy(Arc::new(StaticPolicy::down(100, "cloud-0")));

		engine.evaluate().await;

		assert!(provisioner.provisioned.lock().unwrap().is_empty());
		assert_eq!(
			provisioner.decommissioned.lock().unwrap().as_slice(),
			["cloud-0"]
		);
	}

	struct PlanPolicy;

	#[async_trait]
	impl ScalingPolicy for PlanPolicy {
		fn name(&self) -> &'static str {
			"plan"
		}

		fn priority(&self) -> i32 {
			50
		}

		async fn should_consolidate(&self, _ctx: &ScalingContext) -> Option<ConsolidationPlan> {
			Some(ConsolidationPlan {
				migrations: Vec::new(),
				nodes_to_keep: vec!["cloud-0".into()],
				nodes_to_remove: vec!["cloud-1".into(), "cloud-2".into()],
				node_savings: 2,
				estimated_monthly_savings_eur: 18.0,
				reason: "test".into(),
			})
		}
	}

	struct RecordingExecutor {
		ran: AtomicBool,
	}

	#[async_trait]
	impl MigrationExecutor for RecordingExecutor {
		async fn execute(&self, _plan: &ConsolidationPlan) -> anyhow::Result<MigrationReport> {
			self.ran.store(true, Ordering::SeqCst);
			Ok(MigrationReport::default())
		}
	}

	#[tokio::test]
	async fn consolidation_goes_through_the_injected_executor() {
		let engine = engine_with(Arc::new(MockProvisioner::default())).await;
		let executor = Arc::new(RecordingExecutor {
			ran: AtomicBool::new(false),
		});
		engine.set_migration_executor(executor.clone());
		engine.register_policy(Arc::new(PlanPolicy));

		engine.evaluate().await;
		assert!(executor.ran.load(Ordering::SeqCst));
	}
}
