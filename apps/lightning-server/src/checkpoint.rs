use anyhow::Context;
use lightning::engine::types::parse_lsn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info};

/// Last replication position whose fan-out completed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub lsn: Option<String>,
    #[serde(default)]
    pub batches: u64,
}

pub fn load_checkpoint(path: &Path) -> Checkpoint {
    if path.exists() {
        info!("Loading checkpoint from {:?}", path);
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Checkpoint>(&content) {
                Ok(checkpoint) => return checkpoint,
                Err(e) => error!("Failed to deserialize checkpoint file: {}", e),
            },
            Err(e) => error!("Failed to read checkpoint file: {}", e),
        }
    } else {
        info!("No checkpoint at {:?}, starting from the feed head", path);
    }
    Checkpoint::default()
}

pub fn save_checkpoint(path: &Path, checkpoint: &Checkpoint) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create checkpoint directory")?;
    }
    let content = serde_json::to_string(checkpoint).context("Failed to serialize checkpoint")?;
    fs::write(path, content).context("Failed to write checkpoint file")?;
    Ok(())
}

impl Checkpoint {
    pub fn position(&self) -> Option<u64> {
        self.lsn.as_deref().and_then(parse_lsn)
    }
}

/// Debounced writer for the acknowledged position.
pub struct CheckpointSaver {
    path: PathBuf,
    /// Position loaded at startup; batches at or before it were already fanned out.
    resume_after: Option<u64>,
    state: RwLock<Checkpoint>,
    notify: Arc<Notify>,
    shutdown: Arc<Notify>,
    debounce_duration: Duration,
}

impl CheckpointSaver {
    pub fn new(path: PathBuf, initial: Checkpoint, debounce_ms: u64) -> Self {
        Self {
            path,
            resume_after: initial.position(),
            state: RwLock::new(initial),
            notify: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
            debounce_duration: Duration::from_millis(debounce_ms),
        }
    }

    /// Record a completed batch. The position only moves forward; batches without a
    /// position, or behind the current one, only bump the counter.
    pub async fn acknowledge(&self, lsn: Option<&str>) {
        {
            let mut state = self.state.write().await;
            if let Some(lsn) = lsn {
                let ahead = match (parse_lsn(lsn), state.position()) {
                    (Some(new), Some(current)) => new > current,
                    (Some(_), None) => true,
                    (None, _) => state.lsn.is_none(),
                };
                if ahead {
                    state.lsn = Some(lsn.to_string());
                } else {
                    debug!(lsn, current = ?state.lsn, "Acknowledged position is not ahead, keeping checkpoint");
                }
            }
            state.batches += 1;
        }
        self.trigger_save();
    }

    pub fn resume_after(&self) -> Option<u64> {
        self.resume_after
    }

    /// Whether a batch at `lsn` was already acknowledged before this process started.
    pub fn is_replayed(&self, lsn: Option<&str>) -> bool {
        match (lsn.and_then(parse_lsn), self.resume_after) {
            (Some(position), Some(resume)) => position <= resume,
            _ => false,
        }
    }

    pub async fn current(&self) -> Checkpoint {
        self.state.read().await.clone()
    }

    pub fn trigger_save(&self) {
        self.notify.notify_one();
    }

    pub async fn run(self: Arc<Self>) {
        info!("Checkpoint saver started");
        loop {
            tokio::select! {
                _ = self.notify.notified() => {
                    debug!("Checkpoint moved, waiting {:?} before saving", self.debounce_duration);
                    sleep(self.debounce_duration).await;
                    self.save_now().await;
                }
                _ = self.shutdown.notified() => {
                    info!("Shutdown signal received, writing final checkpoint");
                    self.save_now().await;
                    break;
                }
            }
        }
        info!("Checkpoint saver stopped");
    }

    pub fn signal_shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub async fn save_now(&self) {
        let checkpoint = self.current().await;
        match save_checkpoint(&self.path, &checkpoint) {
            Ok(()) => debug!(lsn = ?checkpoint.lsn, "Checkpoint saved"),
            Err(e) => error!("Checkpoint save failed: {:#}", e),
        }
    }
}

#[cfg(test)]
mod checkpoint_tests {
    use super::*;

    #[tokio::test]
    async fn test_acknowledge_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("checkpoint.json");
        assert_eq!(load_checkpoint(&path), Checkpoint::default());

        let saver = CheckpointSaver::new(path.clone(), Checkpoint::default(), 0);
        saver.acknowledge(Some("0/1A")).await;
        saver.acknowledge(None).await;
        saver.save_now().await;

        assert_eq!(
            load_checkpoint(&path),
            Checkpoint {
                lsn: Some("0/1A".into()),
                batches: 2
            }
        );
    }

    #[tokio::test]
    async fn test_position_only_moves_forward() {
        let dir = tempfile::tempdir().unwrap();
        let saved = Checkpoint {
            lsn: Some("0/16B3748".into()),
            batches: 3,
        };
        let saver = CheckpointSaver::new(dir.path().join("checkpoint.json"), saved, 10);

        saver.acknowledge(Some("0/1")).await;
        let current = saver.current().await;
        assert_eq!(current.lsn.as_deref(), Some("0/16B3748"));
        assert_eq!(current.batches, 4);

        saver.acknowledge(Some("1/0")).await;
        saver.acknowledge(Some("0/FFFFFFFF")).await;
        saver.acknowledge(Some("not-a-position")).await;
        assert_eq!(saver.current().await.lsn.as_deref(), Some("1/0"));
    }

    #[test]
    fn test_replayed_batches_are_detected_from_loaded_position() {
        let saved = Checkpoint {
            lsn: Some("0/9F".into()),
            batches: 1,
        };
        let saver = CheckpointSaver::new(PathBuf::from("unused.json"), saved, 0);
        assert_eq!(saver.resume_after(), Some(0x9F));
        assert!(saver.is_replayed(Some("0/10")));
        assert!(saver.is_replayed(Some("0/9F")));
        assert!(!saver.is_replayed(Some("0/A0")));
        assert!(!saver.is_replayed(None));

        let fresh = CheckpointSaver::new(PathBuf::from("unused.json"), Checkpoint::default(), 0);
        assert!(!fresh.is_replayed(Some("0/1")));
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(&path, "not json").unwrap();
        assert_eq!(load_checkpoint(&path), Checkpoint::default());
    }
}
