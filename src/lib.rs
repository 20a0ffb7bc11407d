pub mod config;
pub mod error;
pub mod frame;
pub mod logging;
pub mod pool;
pub mod providers;
pub mod relay;
pub mod server;
pub mod session;
pub mod transform;
pub mod upstream;

pub use config::{ProxyConfig, UpstreamTarget};
pub use error::{ProxyError, Result};
pub use logging::SharedAccessLog;
pub use server::{build_router, AppState};
pub use transform::{transform, CacheControl, ChatRequest};
pub use upstream::{UpstreamClient, UpstreamResponse};
