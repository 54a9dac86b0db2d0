//! Monitor manager
//!
//! ## Responsibilities
//!
//! - Persist monitor configs, one JSON file per monitor
//! - Reconcile the desired set against the running set
//! - Expose censored/uncensored views and the external trigger input
//!
//! The manager map is the single owner of runtime monitors: exactly one
//! running instance per enabled config id. All mutations take the map lock,
//! so concurrent `set` calls on the same id serialize and the on-disk
//! config always matches the running monitor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::EnvConfig;
use crate::error::{Error, Result};
use crate::log_bus::Logger;
use crate::monitor::{config::MonitorInfo, HookSet, Monitor, MonitorConfig};
use crate::recorder::Event;
use crate::rtsp::RtspServer;

struct Entry {
    config: Arc<MonitorConfig>,
    running: Option<Arc<Monitor>>,
}

/// Supervisor of all monitors.
pub struct MonitorManager {
    dir: PathBuf,
    env: EnvConfig,
    logger: Arc<Logger>,
    server: Arc<RtspServer>,
    hooks: Arc<HookSet>,
    token: CancellationToken,
    monitors: Mutex<HashMap<String, Entry>>,
}

impl MonitorManager {
    /// Load all configs from disk. A corrupt config directory is fatal.
    pub fn new(
        env: EnvConfig,
        logger: Arc<Logger>,
        server: Arc<RtspServer>,
        hooks: HookSet,
        token: CancellationToken,
    ) -> Result<Arc<Self>> {
        let dir = env.monitors_dir();
        std::fs::create_dir_all(&dir)?;

        let mut monitors = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read(&path)?;
            let config: MonitorConfig = serde_json::from_slice(&raw).map_err(|e| {
                Error::Fatal(format!("corrupt monitor config {}: {e}", path.display()))
            })?;
            config
                .validate()
                .map_err(|e| Error::Fatal(format!("monitor config {}: {e}", path.display())))?;
            monitors.insert(
                config.id.clone(),
                Entry {
                    config: Arc::new(config),
                    running: None,
                },
            );
        }

        Ok(Arc::new(Self {
            dir,
            env,
            logger,
            server,
            hooks: Arc::new(hooks),
            token,
            monitors: Mutex::new(monitors),
        }))
    }

    /// Start every enabled monitor that is not already running.
    pub async fn start_all(&self) {
        let mut monitors = self.monitors.lock().await;
        let ids: Vec<String> = monitors.keys().cloned().collect();
        for id in ids {
            let entry = monitors.get_mut(&id).expect("id from keys");
            if !entry.config.enable || entry.running.is_some() {
                continue;
            }
            if let Err(e) = self.start_entry(entry).await {
                self.logger
                    .error()
                    .source("monitors")
                    .monitor(&id)
                    .msg(format!("could not start: {e}"))
                    .await;
            }
        }
    }

    /// Stop every running monitor and wait for each to wind down.
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.lock().await;
        for entry in monitors.values_mut() {
            if let Some(monitor) = entry.running.take() {
                monitor.stop().await;
            }
        }
    }

    /// Atomically replace the on-disk config, then reconcile the runtime:
    /// a running monitor restarts under a fresh lifetime token; a disabled
    /// config only stops.
    pub async fn set(&self, config: MonitorConfig) -> Result<()> {
        config.validate()?;
        let mut monitors = self.monitors.lock().await;

        let path = self.dir.join(format!("{}.json", config.id));
        let tmp = self.dir.join(format!("{}.json.tmp", config.id));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&config)?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let entry = monitors.entry(config.id.clone()).or_insert(Entry {
            config: Arc::new(config.clone()),
            running: None,
        });
        entry.config = Arc::new(config);
        if let Some(old) = entry.running.take() {
            old.stop().await;
        }
        if entry.config.enable {
            self.start_entry(entry).await?;
        }
        Ok(())
    }

    /// Stop and start one monitor under a new lifetime token.
    pub async fn restart(&self, id: &str) -> Result<()> {
        let mut monitors = self.monitors.lock().await;
        let entry = monitors
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("monitor: {id}")))?;
        if let Some(old) = entry.running.take() {
            old.stop().await;
        }
        if entry.config.enable {
            self.start_entry(entry).await?;
        }
        Ok(())
    }

    /// Stop the monitor, remove its config and release its stream paths.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut monitors = self.monitors.lock().await;
        let entry = monitors
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("monitor: {id}")))?;
        if let Some(monitor) = entry.running {
            monitor.stop().await;
        }
        tokio::fs::remove_file(self.dir.join(format!("{id}.json"))).await?;
        self.server.unregister_path(id).await;
        self.server.unregister_path(&format!("{id}_sub")).await;
        Ok(())
    }

    /// Censored views for the web layer.
    pub async fn monitors_info(&self) -> Vec<MonitorInfo> {
        let monitors = self.monitors.lock().await;
        let mut out: Vec<MonitorInfo> = monitors
            .values()
            .map(|entry| MonitorInfo {
                id: entry.config.id.clone(),
                name: entry.config.name.clone(),
                enable: entry.config.enable,
                audio_enabled: entry.config.audio_enabled,
                has_sub_stream: entry.config.sub_input.is_some(),
                running: entry.running.is_some(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Uncensored configs, admin only.
    pub async fn monitor_configs(&self) -> Vec<MonitorConfig> {
        let monitors = self.monitors.lock().await;
        let mut out: Vec<MonitorConfig> = monitors
            .values()
            .map(|entry| (*entry.config).clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Deliver an external event into a running monitor's recorder.
    pub async fn trigger(&self, id: &str, event: Event) -> Result<()> {
        let monitors = self.monitors.lock().await;
        let entry = monitors
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("monitor: {id}")))?;
        let Some(monitor) = &entry.running else {
            return Err(Error::Validation(format!("monitor not running: {id}")));
        };
        monitor
            .trigger_tx
            .send(event)
            .await
            .map_err(|_| Error::Internal("trigger channel closed".to_string()))
    }

    async fn start_entry(&self, entry: &mut Entry) -> Result<()> {
        let (monitor, trigger_rx) = Monitor::new(
            entry.config.clone(),
            self.env.clone(),
            self.logger.clone(),
            self.hooks.clone(),
            &self.token,
        );
        monitor.start(&self.server, trigger_rx).await?;
        entry.running = Some(monitor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(id: &str, enable: bool) -> MonitorConfig {
        MonitorConfig {
            id: id.to_string(),
            name: format!("Monitor {id}"),
            enable,
            audio_enabled: false,
            main_input: "rtsp://cam/main".to_string(),
            sub_input: None,
            hwaccel: String::new(),
            video_encoder: String::new(),
            audio_encoder: String::new(),
            always_record: false,
            video_length: 15.0,
            timestamp_offset: 0,
            motion_detection: None,
            thumb_scale: None,
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        manager: Arc<MonitorManager>,
        env: EnvConfig,
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let env = EnvConfig {
            config_dir: tmp.path().join("configs"),
            storage_dir: tmp.path().join("storage"),
            shm_dir: tmp.path().join("shm"),
            // The encoder supervisor exits immediately and backs off.
            ffmpeg_bin: "/bin/false".to_string(),
            ..Default::default()
        };
        env.prepare_environment().unwrap();

        let logger = Arc::new(Logger::new(CancellationToken::new(), &[]));
        let server = RtspServer::new(logger.clone(), 0);
        let manager = MonitorManager::new(
            env.clone(),
            logger,
            server,
            HookSet::new(),
            CancellationToken::new(),
        )
        .unwrap();

        Fixture {
            _tmp: tmp,
            manager,
            env,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_set_persists_and_starts() {
        let fixture = fixture().await;
        let manager = &fixture.manager;

        manager.set(test_config("m1", false)).await.unwrap();
        assert!(fixture.env.monitors_dir().join("m1.json").exists());
        let info = manager.monitors_info().await;
        assert_eq!(info.len(), 1);
        assert!(!info[0].running);

        manager.set(test_config("m1", true)).await.unwrap();
        let info = manager.monitors_info().await;
        assert!(info[0].running);
        assert!(info[0].enable);

        manager.stop_all().await;
        let info = manager.monitors_info().await;
        assert!(!info[0].running);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_set_rejects_invalid_config() {
        let fixture = fixture().await;
        let err = fixture
            .manager
            .set(test_config("bad id!", true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(fixture.manager.monitors_info().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restart_and_delete() {
        let fixture = fixture().await;
        let manager = &fixture.manager;

        manager.set(test_config("m1", true)).await.unwrap();
        manager.restart("m1").await.unwrap();
        assert!(manager.monitors_info().await[0].running);

        manager.delete("m1").await.unwrap();
        assert!(manager.monitors_info().await.is_empty());
        assert!(!fixture.env.monitors_dir().join("m1.json").exists());

        assert!(matches!(
            manager.restart("m1").await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            manager.delete("m1").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_configs_loaded_at_startup() {
        let fixture = fixture().await;
        fixture
            .manager
            .set(test_config("m1", false))
            .await
            .unwrap();
        fixture
            .manager
            .set(test_config("m2", false))
            .await
            .unwrap();

        let logger = Arc::new(Logger::new(CancellationToken::new(), &[]));
        let server = RtspServer::new(logger.clone(), 0);
        let reloaded = MonitorManager::new(
            fixture.env.clone(),
            logger,
            server,
            HookSet::new(),
            CancellationToken::new(),
        )
        .unwrap();

        let configs = reloaded.monitor_configs().await;
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].id, "m1");
        // Uncensored view carries the input URL.
        assert_eq!(configs[0].main_input, "rtsp://cam/main");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_corrupt_config_dir_is_fatal() {
        let fixture = fixture().await;
        std::fs::write(fixture.env.monitors_dir().join("bad.json"), b"{nope").unwrap();

        let logger = Arc::new(Logger::new(CancellationToken::new(), &[]));
        let server = RtspServer::new(logger.clone(), 0);
        let result = MonitorManager::new(
            fixture.env.clone(),
            logger,
            server,
            HookSet::new(),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(Error::Fatal(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_set_single_winner() {
        let fixture = fixture().await;
        let manager = fixture.manager.clone();

        let mut a = test_config("m1", false);
        a.name = "A".to_string();
        let mut b = test_config("m1", false);
        b.name = "B".to_string();

        let m1 = manager.clone();
        let m2 = manager.clone();
        let (ra, rb) = tokio::join!(m1.set(a), m2.set(b));
        ra.unwrap();
        rb.unwrap();

        // Exactly one config on disk, matching the in-memory one.
        let on_disk: MonitorConfig = serde_json::from_slice(
            &std::fs::read(fixture.env.monitors_dir().join("m1.json")).unwrap(),
        )
        .unwrap();
        let in_memory = &manager.monitor_configs().await[0];
        assert_eq!(&on_disk, in_memory);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trigger_requires_running_monitor() {
        let fixture = fixture().await;
        let manager = &fixture.manager;
        let event = Event {
            time: chrono::Utc::now(),
            duration: chrono::Duration::seconds(5),
            detections: Vec::new(),
        };

        assert!(matches!(
            manager.trigger("m1", event.clone()).await.unwrap_err(),
            Error::NotFound(_)
        ));

        manager.set(test_config("m1", false)).await.unwrap();
        assert!(matches!(
            manager.trigger("m1", event.clone()).await.unwrap_err(),
            Error::Validation(_)
        ));

        manager.set(test_config("m1", true)).await.unwrap();
        manager.trigger("m1", event).await.unwrap();
        manager.stop_all().await;
    }
}
