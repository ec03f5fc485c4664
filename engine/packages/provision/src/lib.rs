mod hetzner;
mod provider;
mod provisioner;

pub use hetzner::HetznerClient;
pub use provider::{CloudImage, CloudProvider, CloudServer, CreateServerRequest};
pub use provisioner::{DecommissionError, Provisioner};
