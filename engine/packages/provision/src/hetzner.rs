use std::{collections::HashMap, time::Duration};

use anyhow::{Context, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_types::ServerTypeSpec;
use reqwest::header;
use serde::Deserialize;

use crate::provider::{CloudImage, CloudProvider, CloudServer, CreateServerRequest};

const DEFAULT_BASE_URL: &str = "https://api.hetzner.cloud/v1";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Hetzner Cloud API client.
pub struct HetznerClient {
	http: reqwest::Client,
	base_url: String,
}

impl HetznerClient {
	pub fn new(api_token: &str) -> anyhow::Result<Self> {
		Self::with_base_url(api_token, DEFAULT_BASE_URL)
	}

	pub fn with_base_url(api_token: &str, base_url: impl Into<String>) -> anyhow::Result<Self> {
		let mut headers = header::HeaderMap::new();
		let mut auth = header::HeaderValue::from_str(&format!("Bearer {api_token}"))
			.context("invalid api token")?;
		auth.set_sensitive(true);
		headers.insert(header::AUTHORIZATION, auth);

		let http = reqwest::Client::builder()
			.default_headers(headers)
			.timeout(HTTP_TIMEOUT)
			.build()?;

		Ok(Self {
			http,
			base_url: base_url.into(),
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}{path}", self.base_url)
	}
}

#[derive(Deserialize)]
struct ServerEnvelope {
	server: ApiServer,
}

#[derive(Deserialize)]
struct ServersEnvelope {
	servers: Vec<ApiServer>,
}

#[derive(Deserialize)]
struct ApiServer {
	id: u64,
	name: String,
	status: String,
	created: Option<DateTime<Utc>>,
	public_net: ApiPublicNet,
	server_type: ApiServerType,
	#[serde(default)]
	labels: HashMap<String, String>,
}

#[derive(Deserialize)]
struct ApiPublicNet {
	ipv4: Option<ApiIpv4>,
}

#[derive(Deserialize)]
struct ApiIpv4 {
	ip: String,
}

#[derive(Deserialize)]
struct ServerTypesEnvelope {
	server_types: Vec<ApiServerType>,
}

#[derive(Deserialize)]
struct ApiServerType {
	name: String,
	/// Memory in GB.
	memory: f64,
	cores: u32,
	#[serde(default)]
	prices: Vec<ApiPrice>,
}

#[derive(Deserialize)]
struct ApiPrice {
	price_hourly: ApiAmount,
}

#[derive(Deserialize)]
struct ApiAmount {
	gross: String,
}

#[derive(Deserialize)]
struct ImagesEnvelope {
	images: Vec<ApiImage>,
}

#[derive(Deserialize)]
struct ImageEnvelope {
	image: ApiImage,
}

#[derive(Deserialize)]
struct ApiImage {
	id: u64,
	#[serde(default)]
	name: Option<String>,
	description: Option<String>,
	#[serde(rename = "type")]
	image_type: String,
}

#[derive(Deserialize)]
struct MetricsEnvelope {
	metrics: ApiMetrics,
}

#[derive(Deserialize)]
struct ApiMetrics {
	time_series: HashMap<String, ApiTimeSeries>,
}

#[derive(Deserialize)]
struct ApiTimeSeries {
	values: Vec<(f64, String)>,
}

impl ApiServerType {
	fn hourly_eur(&self) -> f64 {
		self.prices
			.first()
			.and_then(|p| p.price_hourly.gross.parse::<f64>().ok())
			.unwrap_or(0.0)
	}
}

impl From<ApiServer> for CloudServer {
	fn from(s: ApiServer) -> Self {
		let hourly_cost_eur = s.server_type.hourly_eur();
		CloudServer {
			id: s.id.to_string(),
			name: s.name,
			public_ip: s.public_net.ipv4.map(|v| v.ip).unwrap_or_default(),
			status: s.status,
			server_type: s.server_type.name,
			ram_mb: (s.server_type.memory * 1024.0) as u64,
			cores: s.server_type.cores,
			hourly_cost_eur,
			labels: s.labels,
			created_at: s.created,
		}
	}
}

impl From<ApiImage> for CloudImage {
	fn from(i: ApiImage) -> Self {
		CloudImage {
			id: i.id.to_string(),
			name: i.name.unwrap_or_default(),
			description: i.description,
			image_type: i.image_type,
		}
	}
}

#[async_trait]
impl CloudProvider for HetznerClient {
	async fn create_server(&self, req: CreateServerRequest) -> anyhow::Result<CloudServer> {
		let res = self
			.http
			.post(self.url("/servers"))
			.json(&serde_json::json!({
				"name": req.name,
				"server_type": req.server_type,
				"image": req.image,
				"location": req.location,
				"labels": req.labels,
			}))
			.send()
			.await?
			.error_for_status()?
			.json::<ServerEnvelope>()
			.await?;
		Ok(res.server.into())
	}

	async fn delete_server(&self, provider_id: &str) -> anyhow::Result<()> {
		self.http
			.delete(self.url(&format!("/servers/{provider_id}")))
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}

	async fn server(&self, provider_id: &str) -> anyhow::Result<CloudServer> {
		let res = self
			.http
			.get(self.url(&format!("/servers/{provider_id}")))
			.send()
			.await?
			.error_for_status()?
			.json::<ServerEnvelope>()
			.await?;
		Ok(res.server.into())
	}

	async fn list_servers(&self, label_selector: &str) -> anyhow::Result<Vec<CloudServer>> {
		let res = self
			.http
			.get(self.url("/servers"))
			.query(&[("label_selector", label_selector)])
			.send()
			.await?
			.error_for_status()?
			.json::<ServersEnvelope>()
			.await?;
		Ok(res.servers.into_iter().map(Into::into).collect())
	}

	async fn server_types(&self) -> anyhow::Result<Vec<ServerTypeSpec>> {
		let res = self
			.http
			.get(self.url("/server_types"))
			.send()
			.await?
			.error_for_status()?
			.json::<ServerTypesEnvelope>()
			.await?;
		Ok(res
			.server_types
			.into_iter()
			.map(|t| {
				let hourly_cost_eur = t.hourly_eur();
				ServerTypeSpec {
					name: t.name,
					ram_mb: (t.memory * 1024.0) as u64,
					cores: t.cores,
					hourly_cost_eur,
				}
			})
			.collect())
	}

	async fn images(&self) -> anyhow::Result<Vec<CloudImage>> {
		let res = self
			.http
			.get(self.url("/images"))
			.query(&[("type", "snapshot"), ("sort", "created:desc")])
			.send()
			.await?
			.error_for_status()?
			.json::<ImagesEnvelope>()
			.await?;
		Ok(res.images.into_iter().map(Into::into).collect())
	}

	async fn wait_until_reachable(
		&self,
		provider_id: &str,
		timeout: Duration,
	) -> anyhow::Result<CloudServer> {
		let deadline = tokio::time::Instant::now() + timeout;

		loop {
			let server = self.server(provider_id).await?;
			if server.status == "running" && !server.public_ip.is_empty() {
				let addr = format!("{}:22", server.public_ip);
				let connect = tokio::time::timeout(
					Duration::from_secs(5),
					tokio::net::TcpStream::connect(&addr),
				)
				.await;
				if matches!(connect, Ok(Ok(_))) {
					return Ok(server);
				}
			}

			if tokio::time::Instant::now() >= deadline {
				bail!("server {provider_id} not reachable within {timeout:?}");
			}
			tokio::time::sleep(Duration::from_secs(10)).await;
		}
	}

	async fn cpu_percent(&self, provider_id: &str) -> anyhow::Result<f64> {
		let end = Utc::now();
		let start = end - chrono::Duration::minutes(5);
		let res = self
			.http
			.get(self.url(&format!("/servers/{provider_id}/metrics")))
			.query(&[
				("type", "cpu"),
				("start", &start.to_rfc3339()),
				("end", &end.to_rfc3339()),
			])
			.send()
			.await?
			.error_for_status()?
			.json::<MetricsEnvelope>()
			.await?;

		let series = res
			.metrics
			.time_series
			.get("cpu")
			.context("metrics response has no cpu series")?;
		let samples = series
			.values
			.iter()
			.filter_map(|(_, v)| v.parse::<f64>().ok())
			.collect::<Vec<_>>();
		if samples.is_empty() {
			return Ok(0.0);
		}
		Ok(samples.iter().sum::<f64>() / samples.len() as f64)
	}

	async fn create_snapshot(
		&self,
		provider_id: &str,
		description: &str,
	) -> anyhow::Result<CloudImage> {
		let res = self
			.http
			.post(self.url(&format!("/servers/{provider_id}/actions/create_image")))
			.json(&serde_json::json!({
				"type": "snapshot",
				"description": description,
			}))
			.send()
			.await?
			.error_for_status()?
			.json::<ImageEnvelope>()
			.await?;
		Ok(res.image.into())
	}

	async fn delete_image(&self, image_id: &str) -> anyhow::Result<()> {
		self.http
			.delete(self.url(&format!("/images/{image_id}")))
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}

	async fn hourly_price(&self, server_type: &str) -> anyhow::Result<f64> {
		let types = self.server_types().await?;
		types
			.iter()
			.find(|t| t.name == server_type)
			.map(|t| t.hourly_cost_eur)
			.with_context(|| format!("unknown server type {server_type}"))
	}
}
