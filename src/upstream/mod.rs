pub mod health;
pub mod host;
pub mod policy;
pub mod pool;
pub mod upgrade;
pub mod upstream;

pub use host::UpstreamHost;
pub use policy::Policy;
pub use pool::HostPool;
pub use upstream::Upstream;
