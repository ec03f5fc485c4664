use std::{
	collections::HashMap,
	sync::{
		Arc,
		atomic::{AtomicI64, Ordering},
	},
};

use async_trait::async_trait;
use conductor_remote::GameProxy;
use conductor_types::{ContainerInfo, Node, ServerTier};
use conductor_util::timestamp;

use crate::{
	context::ScalingContext,
	policy::{ConsolidationPlan, PlannedMigration, ScalingPolicy},
};

/// Hours billed per month when estimating savings.
const MONTHLY_HOURS: f64 = 720.0;

/// Cost-driven re-packing of cloud workloads onto fewer nodes.
///
/// Only cheap tiers migrate freely; medium servers move when empty and
/// anything larger pins its node. A plan below the savings threshold is
/// discarded rather than churning the fleet for one node.
pub struct ConsolidationPolicy {
	cfg: conductor_config::Consolidation,
	proxy: Arc<dyn GameProxy>,
	last_plan_ms: AtomicI64,
}

struct AnnotatedContainer {
	info: ContainerInfo,
	tier: ServerTier,
	players: u32,
}

impl AnnotatedContainer {
	fn migratable(&self) -> bool {
		match self.tier {
			ServerTier::Micro | ServerTier::Small => true,
			ServerTier::Medium => self.players == 0,
			ServerTier::Large | ServerTier::Xlarge | ServerTier::Custom => false,
		}
	}

	/// Standard bookings match their tier's nominal size exactly.
	fn is_standard(&self) -> bool {
		self.tier.nominal_ram_mb() == Some(self.info.ram_mb)
	}
}

impl ConsolidationPolicy {
	pub fn new(cfg: conductor_config::Consolidation, proxy: Arc<dyn GameProxy>) -> Self {
		Self {
			cfg,
			proxy,
			last_plan_ms: AtomicI64::new(0),
		}
	}

	fn cooldown_elapsed(&self) -> bool {
		let cooldown_ms = self.cfg.cooldown().as_millis() as i64;
		timestamp::now_ms() - self.last_plan_ms.load(Ordering::Relaxed) >= cooldown_ms
	}

	/// Bin size for packing: the most common cloud node capacity, falling
	/// back to the configured default for an irregular fleet.
	fn node_capacity(&self, cloud_nodes: &[Node]) -> u64 {
		let mut counts = HashMap::new();
		for n in cloud_nodes {
			*counts.entry(n.total_ram_mb).or_insert(0usize) += 1;
		}
		counts
			.into_iter()
			.max_by_key(|(_, count)| *count)
			.map(|(ram, _)| ram)
			.unwrap_or(self.cfg.node_capacity_mb)
	}

	async fn annotate(&self, containers: Vec<ContainerInfo>) -> Vec<AnnotatedContainer> {
		let mut annotated = Vec::with_capacity(containers.len());
		for info in containers {
			let players = match self.proxy.player_count(&info.server_name).await {
				Ok(count) => count,
				Err(err) => {
					// Unknown occupancy counts as occupied.
					tracing::warn!(
						server_id = %info.server_id,
						?err,
						"player count unavailable, treating server as occupied"
					);
					1
				}
			};
			annotated.push(AnnotatedContainer {
				tier: ServerTier::from_ram_mb(info.ram_mb),
				players,
				info,
			});
		}
		annotated
	}

	/// Nodes needed for the whole cloud workload set. Standard tiers pack
	/// by the closed formula; irregular sizes fall back to first-fit
	/// decreasing. Non-migratable custom containers each pin a node.
	fn needed_nodes(&self, containers: &[AnnotatedContainer], capacity_mb: u64) -> usize {
		let (custom, rest): (Vec<_>, Vec<_>) = containers
			.iter()
			.partition(|c| c.tier == ServerTier::Custom);

		let needed_for_rest = if rest.iter().all(|c| c.is_standard()) {
			let mut tier_counts: HashMap<ServerTier, usize> = HashMap::new();
			for c in &rest {
				*tier_counts.entry(c.tier).or_insert(0) += 1;
			}

			tier_counts
				.into_iter()
				.map(|(tier, count)| {
					let nominal = tier.nominal_ram_mb().unwrap_or(capacity_mb);
					let per_node = (capacity_mb / nominal).max(1) as usize;
					count.div_ceil(per_node)
				})
				.sum()
		} else {
			first_fit_decreasing(
				rest.iter().map(|c| c.info.ram_mb).collect(),
				capacity_mb,
			)
		};

		needed_for_rest + custom.len()
	}
}

/// First-fit decreasing over node-sized bins, preferring the fullest bin
/// that still fits. Returns the bin count.
fn first_fit_decreasing(mut sizes: Vec<u64>, capacity_mb: u64) -> usize {
	sizes.sort_unstable_by(|a, b| b.cmp(a));
	let mut bins: Vec<u64> = Vec::new();

	for size in sizes {
		let target = bins
			.iter_mut()
			.filter(|fill| **fill + size <= capacity_mb)
			.max_by_key(|fill| **fill);
		match target {
			Some(fill) => *fill += size,
			None => bins.push(size.min(capacity_mb)),
		}
	}

	bins.len()
}

#[async_trait]
impl ScalingPolicy for ConsolidationPolicy {
	fn name(&self) -> &'static str {
		"consolidation"
	}

	fn priority(&self) -> i32 {
		50
	}

	async fn should_consolidate(&self, ctx: &ScalingContext) -> Option<ConsolidationPlan> {
		if !self.cfg.enabled {
			return None;
		}
		if ctx.cloud_nodes.len() < 2 {
			return None;
		}
		// Never re-pack a hot fleet.
		if ctx.stats.utilization_percent >= self.cfg.max_utilization_percent {
			return None;
		}
		if !self.cooldown_elapsed() {
			return None;
		}

		let mut all = Vec::new();
		for node in &ctx.cloud_nodes {
			all.extend(ctx.containers.by_node(&node.id));
		}
		let annotated = self.annotate(all).await;

		let capacity_mb = self.node_capacity(&ctx.cloud_nodes);
		let needed = self.needed_nodes(&annotated, capacity_mb);

		// Nodes hosting anything non-migratable cannot be vacated.
		let pinned = ctx
			.cloud_nodes
			.iter()
			.filter(|n| {
				annotated
					.iter()
					.any(|c| c.info.node_id == n.id && !c.migratable())
			})
			.map(|n| n.id.clone())
			.collect::<Vec<_>>();
		let needed = needed.max(pinned.len());

		if ctx.cloud_nodes.len() <= needed {
			return None;
		}
		let node_savings = (ctx.cloud_nodes.len() - needed) as u32;
		if node_savings < self.cfg.min_node_savings {
			tracing::debug!(
				node_savings,
				min = self.cfg.min_node_savings,
				"consolidation plan below savings threshold"
			);
			return None;
		}

		// Keep pinned nodes first, then the fullest nodes up to the target.
		let mut candidates = ctx.cloud_nodes.clone();
		candidates.sort_by_key(|n| {
			let is_pinned = pinned.contains(&n.id);
			(std::cmp::Reverse(is_pinned), std::cmp::Reverse(n.allocated_ram_mb))
		});

		let nodes_to_keep = candidates
			.iter()
			.take(needed)
			.map(|n| n.id.clone())
			.collect::<Vec<_>>();
		let removed = candidates.iter().skip(needed).collect::<Vec<_>>();

		let migrations = annotated
			.iter()
			.filter(|c| removed.iter().any(|n| n.id == c.info.node_id))
			.map(|c| PlannedMigration {
				server_id: c.info.server_id.clone(),
				server_name: c.info.server_name.clone(),
				from_node: c.info.node_id.clone(),
				ram_mb: c.info.ram_mb,
			})
			.collect::<Vec<_>>();

		let estimated_monthly_savings_eur = removed
			.iter()
			.map(|n| n.hourly_cost_eur * MONTHLY_HOURS)
			.sum();

		self.last_plan_ms
			.store(timestamp::now_ms(), Ordering::Relaxed);

		Some(ConsolidationPlan {
			reason: format!(
				"{} cloud nodes can shrink to {needed} ({:.1}% utilization)",
				ctx.cloud_nodes.len(),
				ctx.stats.utilization_percent
			),
			nodes_to_remove: removed.iter().map(|n| n.id.clone()).collect(),
			nodes_to_keep,
			node_savings,
			estimated_monthly_savings_eur,
			migrations,
		})
	}
}
