use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from `PRESENZA_*` environment variables.
///
/// Consumed by the core, not owned: every knob here feeds a constructor
/// parameter so tests can override values directly.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ordered camera device index candidates (`/dev/video{N}`).
    pub device_candidates: Vec<u32>,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine distance at or below which a gallery lookup is a match.
    pub match_threshold: f32,
    /// Detections below this confidence are dropped.
    pub confidence_floor: f32,
    /// Minimum time between attendance events for one identity.
    pub cooldown: Duration,
    /// Interval between recognition passes; capture runs at device rate.
    pub cadence: Duration,
    /// Per-frame read timeout for the capture source.
    pub read_timeout: Duration,
    /// Frames discarded after a (re)open while auto-exposure settles.
    pub warmup_frames: u32,
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("presenza");

        let model_dir = std::env::var("PRESENZA_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/usr/share/presenza/models"));

        let db_path = std::env::var("PRESENZA_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        Self {
            device_candidates: parse_candidates(
                &std::env::var("PRESENZA_DEVICE_CANDIDATES").unwrap_or_default(),
            ),
            model_dir,
            db_path,
            match_threshold: env_f32("PRESENZA_MATCH_THRESHOLD", 0.6),
            confidence_floor: env_f32("PRESENZA_CONFIDENCE_FLOOR", 0.5),
            cooldown: Duration::from_secs(env_u64("PRESENZA_COOLDOWN_SECS", 60)),
            cadence: Duration::from_millis(env_u64("PRESENZA_CADENCE_MS", 500)),
            read_timeout: Duration::from_millis(env_u64("PRESENZA_READ_TIMEOUT_MS", 2000)),
            warmup_frames: env_u64("PRESENZA_WARMUP_FRAMES", 4) as u32,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

/// Parse a comma-separated list of device indices; defaults to `[0]`.
fn parse_candidates(raw: &str) -> Vec<u32> {
    let parsed: Vec<u32> = raw
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect();
    if parsed.is_empty() {
        vec![0]
    } else {
        parsed
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_parse_in_order() {
        assert_eq!(parse_candidates("1,0"), vec![1, 0]);
        assert_eq!(parse_candidates(" 2, 4 ,1"), vec![2, 4, 1]);
    }

    #[test]
    fn empty_or_garbage_candidates_default_to_zero() {
        assert_eq!(parse_candidates(""), vec![0]);
        assert_eq!(parse_candidates("camera"), vec![0]);
    }
}
