use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use conductor_types::NodeLifecycle;
use conductor_util::timestamp;

use crate::{
	context::ScalingContext,
	policy::{ScaleDownRecommendation, ScaleUpRecommendation, ScaleUrgency, ScalingPolicy},
};

/// Threshold-based scale up/down over fleet RAM utilization.
pub struct ReactivePolicy {
	cfg: conductor_config::Reactive,
	cloud_cfg: conductor_config::Cloud,
	last_scale_up_ms: AtomicI64,
	last_scale_down_ms: AtomicI64,
}

impl ReactivePolicy {
	pub fn new(cfg: conductor_config::Reactive, cloud_cfg: conductor_config::Cloud) -> Self {
		Self {
			cfg,
			cloud_cfg,
			last_scale_up_ms: AtomicI64::new(0),
			last_scale_down_ms: AtomicI64::new(0),
		}
	}

	fn cooldown_elapsed(&self) -> bool {
		let cooldown_ms = self.cfg.cooldown().as_millis() as i64;
		let last = self
			.last_scale_up_ms
			.load(Ordering::Relaxed)
			.max(self.last_scale_down_ms.load(Ordering::Relaxed));
		timestamp::now_ms() - last >= cooldown_ms
	}

	/// No scale-down while a recent scale-up is still settling.
	fn scale_up_grace_elapsed(&self) -> bool {
		let grace_ms = self.cfg.scale_up_grace().as_millis() as i64;
		timestamp::now_ms() - self.last_scale_up_ms.load(Ordering::Relaxed) >= grace_ms
	}

	fn urgency(util: f64) -> ScaleUrgency {
		if util > 95.0 {
			ScaleUrgency::Critical
		} else if util > 92.0 {
			ScaleUrgency::High
		} else if util > 88.0 {
			ScaleUrgency::Medium
		} else {
			ScaleUrgency::Low
		}
	}

	#[cfg(test)]
	fn backdate_last_scale_up(&self, ms_ago: i64) {
		self.last_scale_up_ms
			.store(timestamp::now_ms() - ms_ago, Ordering::Relaxed);
	}
}

#[async_trait]
impl ScalingPolicy for ReactivePolicy {
	fn name(&self) -> &'static str {
		"reactive"
	}

	fn priority(&self) -> i32 {
		100
	}

	async fn should_scale_up(&self, ctx: &ScalingContext) -> Option<ScaleUpRecommendation> {
		if ctx.stats.cloud_nodes >= self.cfg.max_cloud_nodes {
			return None;
		}
		if !self.cooldown_elapsed() {
			return None;
		}

		let util = ctx.stats.utilization_percent;
		if util <= self.cfg.up_threshold_percent {
			return None;
		}

		let urgency = Self::urgency(util);
		let server_type = if urgency == ScaleUrgency::Critical {
			self.cloud_cfg.large_server_type.clone()
		} else {
			self.cloud_cfg.default_server_type.clone()
		};

		self.last_scale_up_ms
			.store(timestamp::now_ms(), Ordering::Relaxed);

		Some(ScaleUpRecommendation {
			server_type,
			urgency,
			reason: format!(
				"fleet utilization {util:.1}% above {:.1}% threshold ({} queued)",
				self.cfg.up_threshold_percent, ctx.queue_len
			),
		})
	}

	async fn should_scale_down(&self, ctx: &ScalingContext) -> Option<ScaleDownRecommendation> {
		if ctx.stats.cloud_nodes <= self.cfg.min_cloud_nodes {
			return None;
		}
		if !self.cooldown_elapsed() || !self.scale_up_grace_elapsed() {
			return None;
		}

		let util = ctx.stats.utilization_percent;
		if util >= self.cfg.down_threshold_percent {
			return None;
		}

		// One node per tick: the least-utilized empty cloud node.
		let candidate = ctx
			.cloud_nodes
			.iter()
			.filter(|n| {
				n.container_count == 0
					&& n.allocated_ram_mb == 0
					&& !matches!(
						n.lifecycle,
						NodeLifecycle::Provisioning | NodeLifecycle::Initializing
					)
			})
			.min_by(|a, b| {
				a.cpu_usage_percent
					.partial_cmp(&b.cpu_usage_percent)
					.unwrap_or(std::cmp::Ordering::Equal)
			})?;

		self.last_scale_down_ms
			.store(timestamp::now_ms(), Ordering::Relaxed);

		Some(ScaleDownRecommendation {
			node_id: candidate.id.clone(),
			reason: format!(
				"fleet utilization {util:.1}% below {:.1}% threshold",
				self.cfg.down_threshold_percent
			),
		})
	}
}
