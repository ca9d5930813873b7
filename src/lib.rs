pub mod api;
pub mod config;
pub mod logger;
pub mod manager;
pub mod notice;
pub mod schema;

pub use api::{ManagerApi, ManagerMethod};
pub use config::BridgeConfig;
pub use logger::{LogConfig, LogHub, LogLevel, LoggerEvent, init_tracing};
pub use manager::Manager;
pub use notice::{Notice, NoticeBoard, PendingNotice};
