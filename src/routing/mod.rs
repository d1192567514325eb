mod matcher;

pub use matcher::Proxy;
