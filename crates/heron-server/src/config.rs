use std::env;

/// Server configuration.
///
/// Every field can be set through `HERON_*` environment variables; CLI
/// flags override the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind the RPC listener on.
    pub bind: String,
    /// Port for the RPC listener.
    pub port: u16,
    /// Number of concurrent in-process worker slots.
    pub workers: usize,
}

impl ServerConfig {
    pub const DEFAULT_BIND: &str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 8090;
    pub const DEFAULT_WORKERS: usize = 4;

    /// Build a config from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind: env::var("HERON_BIND").unwrap_or_else(|_| Self::DEFAULT_BIND.to_owned()),
            port: env::var("HERON_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Self::DEFAULT_PORT),
            workers: env::var("HERON_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Self::DEFAULT_WORKERS)
                .max(1),
        }
    }
}
