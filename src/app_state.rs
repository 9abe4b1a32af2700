use crate::config::{Config, EncodeSettings};
use crate::job::{self, JobLedger, RetimeJob};
use futures::channel::mpsc::{UnboundedSender, unbounded};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

const TEMP_DIR: &str = "temp";
const UPLOADS_DIR: &str = "uploads";
const VIDEOS_DIR: &str = "videos";

async fn init_workspace(workspace: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(workspace.join(TEMP_DIR)).await?;
    tokio::fs::create_dir_all(workspace.join(UPLOADS_DIR)).await?;
    tokio::fs::create_dir_all(workspace.join(VIDEOS_DIR)).await?;
    Ok(())
}

#[derive(Clone)]
pub struct AppState {
    pub job_tx: UnboundedSender<RetimeJob>,
    pub ledger: JobLedger,

    encode: Arc<EncodeSettings>,
    min_speed: f64,
    max_speed: f64,

    temp_dir: PathBuf,
    uploads_dir: PathBuf,
    videos_dir: PathBuf,
    webhook_url: Option<String>,
}

impl AppState {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let workspace = PathBuf::from(&config.workspace);
        init_workspace(&workspace).await?;

        let (tx, rx) = unbounded();
        let ledger = JobLedger::load(&workspace, &tx)?;

        let this = Self {
            job_tx: tx,
            ledger,

            encode: Arc::new(config.encode_settings()),
            min_speed: config.min_speed,
            max_speed: config.max_speed,

            temp_dir: workspace.join(TEMP_DIR),
            uploads_dir: workspace.join(UPLOADS_DIR),
            videos_dir: workspace.join(VIDEOS_DIR),
            webhook_url: config.webhook_url.clone(),
        };

        job::spawn_dispatcher(this.clone(), rx, config.permits);
        Ok(this)
    }

    pub fn temp_dir(&self) -> &Path {
        self.temp_dir.as_path()
    }

    pub fn uploads_dir(&self) -> &Path {
        self.uploads_dir.as_path()
    }

    pub fn videos_dir(&self) -> &Path {
        self.videos_dir.as_path()
    }

    pub fn encode_settings(&self) -> &EncodeSettings {
        &self.encode
    }

    /// Inclusive speed band the upload endpoint accepts. The tempo
    /// chain builder itself is unbounded, so enforcing this here keeps
    /// chain length sane regardless of what clients send.
    pub fn speed_bounds(&self) -> (f64, f64) {
        (self.min_speed, self.max_speed)
    }

    pub async fn call_webhook(&self, job_id: &str, status: &str) {
        if let Some(webhook_url) = &self.webhook_url {
            let payload = json!({
                "job_id": job_id,
                "job_type": "retime",
                "status": status,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            });

            let client = reqwest::Client::new();
            match client
                .post(webhook_url)
                .json(&payload)
                .timeout(std::time::Duration::from_secs(10))
                .send()
                .await
            {
                Ok(response) => {
                    if response.status().is_success() {
                        info!(job_id, webhook_url, "Webhook called successfully");
                    } else {
                        warn!(
                            job_id,
                            webhook_url,
                            status = %response.status(),
                            "Webhook returned non-success status"
                        );
                    }
                }
                Err(err) => {
                    error!(job_id, webhook_url, ?err, "Failed to call webhook");
                }
            }
        }
    }
}
