use async_trait::async_trait;
use serde::Deserialize;

/// Player-routing proxy in front of the fleet. The conductor registers
/// running servers so players can reach them and asks for player counts
/// when deciding what may migrate.
#[async_trait]
pub trait GameProxy: Send + Sync {
	async fn register_server(&self, name: &str, address: &str) -> anyhow::Result<()>;
	async fn unregister_server(&self, name: &str) -> anyhow::Result<()>;
	async fn player_count(&self, name: &str) -> anyhow::Result<u32>;
}

/// Used when no proxy endpoint is configured. Registration is a no-op and
/// every server reports zero players.
#[derive(Debug, Default)]
pub struct NoopProxy;

#[async_trait]
impl GameProxy for NoopProxy {
	async fn register_server(&self, _name: &str, _address: &str) -> anyhow::Result<()> {
		Ok(())
	}

	async fn unregister_server(&self, _name: &str) -> anyhow::Result<()> {
		Ok(())
	}

	async fn player_count(&self, _name: &str) -> anyhow::Result<u32> {
		Ok(0)
	}
}

/// Proxy admin API over HTTP.
pub struct HttpProxyClient {
	http: reqwest::Client,
	base_url: String,
}

#[derive(Deserialize)]
struct PlayerCountResponse {
	count: u32,
}

impl HttpProxyClient {
	pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.timeout(std::time::Duration::from_secs(30))
			.build()?;
		Ok(Self {
			http,
			base_url: base_url.into(),
		})
	}
}

#[async_trait]
impl GameProxy for HttpProxyClient {
	async fn register_server(&self, name: &str, address: &str) -> anyhow::Result<()> {
		self.http
			.post(format!("{}/servers", self.base_url))
			.json(&serde_json::json!({ "name": name, "address": address }))
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}

	async fn unregister_server(&self, name: &str) -> anyhow::Result<()> {
		self.http
			.delete(format!("{}/servers/{name}", self.base_url))
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}

	async fn player_count(&self, name: &str) -> anyhow::Result<u32> {
		let res = self
			.http
			.get(format!("{}/servers/{name}/players", self.base_url))
			.send()
			.await?
			.error_for_status()?
			.json::<PlayerCountResponse>()
			.await?;
		Ok(res.count)
	}
}
