mod daemon;
mod exec;
mod proxy;
mod resources;

pub use daemon::{ContainerDaemon, DaemonError, DockerDaemon, RemoteDaemon, SystemInfo};
pub use exec::{ExecTarget, RemoteError, RemoteExec, SshExec};
pub use proxy::{GameProxy, HttpProxyClient, NoopProxy};
pub use resources::{NodeResources, probe_resources};
