use crate::app_state::AppState;
use crate::ffmpeg;
use crate::tempo::{SpeedFactor, atempo_filter, setpts_filter, speed_tag};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tracing::{error, info};

const MAX_RETRIES: u8 = 5;
const RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// A single upload-to-download unit of work: retime the uploaded file
/// by `speed` and publish the result under `videos/`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RetimeJob {
    pub id: String,
    pub speed: SpeedFactor,

    /// Per-job CRF override; falls back to the configured default.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crf: Option<u8>,

    #[serde(default)]
    #[serde(skip)]
    pub retry_times: Arc<AtomicU8>,
}

impl RetimeJob {
    pub fn new(id: String, speed: SpeedFactor) -> Self {
        Self {
            id,
            speed,
            crf: None,
            retry_times: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn upload_path(&self, state: &AppState) -> PathBuf {
        state.uploads_dir().join(&self.id)
    }

    /// Published filename carries the speed so several retimes of the
    /// same upload can coexist: `<id>.<speed-tag>x.mp4`.
    pub fn output_filename(&self) -> String {
        format!("{}.{}x.mp4", self.id, speed_tag(self.speed))
    }

    /// Run ffmpeg against the uploaded file, writing into a temp dir
    /// and renaming into `videos/` only once the encode succeeded.
    pub async fn execute(&self, state: &AppState) -> anyhow::Result<()> {
        let input = self.upload_path(state);
        let temp_dir = state.temp_dir().join(format!("tmp-{}", self.id));
        tokio::fs::create_dir_all(&temp_dir).await?;

        let temp_out = temp_dir.join(self.output_filename());
        let encode = state.encode_settings();
        let crf = self.crf.unwrap_or(encode.default_crf);

        let mut args: Vec<OsString> = Vec::new();
        args.push("-i".into());
        args.push(input.clone().into_os_string());
        args.push("-vf".into());
        args.push(setpts_filter(self.speed).into());
        args.push("-af".into());
        args.push(atempo_filter(self.speed).into());
        args.push("-c:v".into());
        args.push("libx264".into());
        args.push("-crf".into());
        args.push(crf.to_string().into());
        args.push("-preset".into());
        args.push(encode.preset.clone().into());
        args.push("-c:a".into());
        args.push("aac".into());
        args.push("-b:a".into());
        args.push(encode.audio_bitrate.clone().into());
        args.push("-y".into());
        args.push(temp_out.clone().into_os_string());

        ffmpeg::run(&encode.ffmpeg_path, &args)
            .await
            .inspect_err(|error| {
                error!(job_id = %self.id, ?input, ?error, "ffmpeg retime failed")
            })?;

        let final_path = state.videos_dir().join(self.output_filename());
        tokio::fs::rename(&temp_out, &final_path).await?;
        let _ = tokio::fs::remove_dir_all(&temp_dir).await;
        let _ = tokio::fs::remove_file(&input).await;

        info!(
            job_id = %self.id,
            speed = %self.speed,
            output = %final_path.display(),
            "Retime completed successfully"
        );
        Ok(())
    }

    pub fn wait_for_retry(&self) -> Option<Duration> {
        let retry_times = self.retry_times.load(Ordering::Acquire);
        if retry_times < MAX_RETRIES {
            self.retry_times.store(retry_times + 1, Ordering::Release);
            Some(RETRY_INTERVAL)
        } else {
            None
        }
    }

    /// Remove whatever the failed job left behind.
    pub async fn cleanup(&self, state: &AppState) {
        let _ = tokio::fs::remove_dir_all(state.temp_dir().join(format!("tmp-{}", self.id))).await;
        let _ = tokio::fs::remove_file(self.upload_path(state)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(speed: f64) -> RetimeJob {
        RetimeJob::new("clip42".to_string(), SpeedFactor::new(speed).unwrap())
    }

    #[test]
    fn output_filename_carries_speed_tag() {
        assert_eq!(job(2.0).output_filename(), "clip42.2x.mp4");
        assert_eq!(job(0.25).output_filename(), "clip42.0.25x.mp4");
        assert_eq!(job(1.5).output_filename(), "clip42.1.5x.mp4");
    }

    #[test]
    fn serializes_without_transient_fields() {
        let json = serde_json::to_string(&job(1.5)).unwrap();
        assert!(json.contains(r#""id":"clip42""#));
        assert!(json.contains(r#""speed":1.5"#));
        assert!(!json.contains("crf"));
        assert!(!json.contains("retry_times"));
    }

    #[test]
    fn deserializes_pending_ledger_entry() {
        let restored: RetimeJob =
            serde_json::from_str(r#"{"id":"clip42","speed":3.0,"crf":23}"#).unwrap();
        assert_eq!(restored.id(), "clip42");
        assert_eq!(restored.speed.get(), 3.0);
        assert_eq!(restored.crf, Some(23));
        assert_eq!(restored.retry_times.load(Ordering::Acquire), 0);
    }

    #[test]
    fn deserialize_rejects_invalid_speed() {
        assert!(serde_json::from_str::<RetimeJob>(r#"{"id":"x","speed":0.0}"#).is_err());
        assert!(serde_json::from_str::<RetimeJob>(r#"{"id":"x","speed":-2.0}"#).is_err());
    }

    #[test]
    fn retries_are_capped() {
        let job = job(1.0);
        for _ in 0..MAX_RETRIES {
            assert_eq!(job.wait_for_retry(), Some(RETRY_INTERVAL));
        }
        assert_eq!(job.wait_for_retry(), None);
    }
}
