//! Application state
//!
//! Holds the shared components handed to the web layer.

use std::sync::Arc;

use crate::config::EnvConfig;
use crate::group::GroupManager;
use crate::log_bus::{LogStore, Logger};
use crate::monitor::MonitorManager;
use crate::storage::StorageManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub env: EnvConfig,
    pub logger: Arc<Logger>,
    pub log_store: Arc<LogStore>,
    pub monitor_manager: Arc<MonitorManager>,
    pub group_manager: Arc<GroupManager>,
    pub storage: Arc<StorageManager>,
}
