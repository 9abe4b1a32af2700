use crate::job::RetimeJob;
use futures::channel::mpsc::UnboundedSender;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{error, info, warn};

const PENDING_FILE: &str = "pending-jobs.json";

/// Tracks the set of not-yet-completed retime jobs and persists it to a
/// JSON file so a restart can pick up where it left off.
#[derive(Debug, Clone)]
pub struct JobLedger {
    path: PathBuf,
    jobs: Arc<TokioMutex<Vec<RetimeJob>>>,
}

impl JobLedger {
    /// Load pending jobs from the workspace and re-enqueue them.
    pub fn load(workspace: &Path, tx: &UnboundedSender<RetimeJob>) -> anyhow::Result<Self> {
        let path = workspace.join(PENDING_FILE);
        let jobs: Vec<RetimeJob> = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .inspect_err(|error| {
                    warn!(?error, ?path, "Failed to parse pending jobs file");
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        info!(
            count = jobs.len(),
            file = %path.display(),
            "Initialize job ledger"
        );

        for job in jobs.iter() {
            info!(job_id = %job.id(), speed = %job.speed, "Re-enqueueing pending job");
            _ = tx.unbounded_send(job.clone());
        }

        Ok(Self {
            path,
            jobs: Arc::new(TokioMutex::new(jobs)),
        })
    }

    async fn save(&self, jobs: &[RetimeJob]) -> anyhow::Result<()> {
        let content = serde_json::to_string(jobs)?;
        tracing::debug!(path = %self.path.display(), ?content, "Saving pending jobs");

        Ok(tokio::fs::write(&self.path, content).await?)
    }

    /// Adds a job to the set and persists the change.
    pub async fn add(&self, job: &RetimeJob) {
        tracing::debug!(id = %job.id(), "Adding job");
        let mut jobs = self.jobs.lock().await;

        // remove any existing job with the same ID
        jobs.retain(|j| j.id() != job.id());
        jobs.push(job.clone());

        if let Err(error) = self.save(&jobs).await {
            error!(?error, "Failed to save pending jobs after adding a job");
        }
    }

    /// Removes a job from the set by its ID and persists the change.
    pub async fn remove(&self, id: &str) {
        tracing::debug!(id, "Removing job");
        let mut jobs = self.jobs.lock().await;
        jobs.retain(|j| j.id() != id);

        if let Err(error) = self.save(&jobs).await {
            error!(id, ?error, "Failed to save pending jobs after removing a job");
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.jobs.lock().await.iter().any(|j| j.id() == id)
    }

    pub async fn pending_count(&self) -> usize {
        self.jobs.lock().await.len()
    }
}
