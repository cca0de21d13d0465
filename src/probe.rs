use crate::storage::LocalObjectStore;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

/// Learns the real length of a video so playback can replace its default.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn video_duration(&self, media_ref: &str) -> Result<Duration>;
}

/// Ensure `ffprobe` is on PATH by invoking `ffprobe -version`.
pub async fn ensure_ffprobe_available() -> Result<()> {
    let status = Command::new("ffprobe")
        .arg("-version")
        .kill_on_drop(true)
        .status()
        .await;
    match status {
        Ok(s) if s.success() => Ok(()),
        Ok(s) => Err(anyhow!("ffprobe not available (exit status {})", s)),
        Err(e) => Err(anyhow!("ffprobe not available: {}", e)),
    }
}

/// Parse the single `format=duration` line ffprobe prints, in seconds.
pub fn parse_duration_output(stdout: &str) -> Result<Duration> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| anyhow!("ffprobe printed no duration"))?;
    let secs: f64 = line
        .parse()
        .with_context(|| format!("unparseable duration: {:?}", line))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(anyhow!("non-positive duration: {}", secs));
    }
    Duration::try_from_secs_f64(secs).with_context(|| format!("duration out of range: {}", secs))
}

/// Runs `ffprobe` against local files or remote URLs.
#[derive(Debug, Clone, Default)]
pub struct FfprobeProbe {
    local: Option<LocalObjectStore>,
}

impl FfprobeProbe {
    pub fn new(local: Option<LocalObjectStore>) -> Self {
        Self { local }
    }

    fn input_for(&self, media_ref: &str) -> String {
        self.local
            .as_ref()
            .and_then(|s| s.path_for(media_ref))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| media_ref.to_string())
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn video_duration(&self, media_ref: &str) -> Result<Duration> {
        let input = self.input_for(media_ref);
        let output = Command::new("ffprobe")
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(&input)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn ffprobe for {}", input))?;

        if !output.status.success() {
            return Err(anyhow!(
                "ffprobe exited with status {} for {}: {}",
                output.status,
                input,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        parse_duration_output(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ffprobe_output() {
        assert_eq!(
            parse_duration_output("12.500000\n").unwrap(),
            Duration::from_millis(12_500)
        );
        assert!(parse_duration_output("").is_err());
        assert!(parse_duration_output("N/A\n").is_err());
        assert!(parse_duration_output("0.000000").is_err());
        assert!(parse_duration_output("1e30\n").is_err());
    }

    #[test]
    fn local_references_resolve_to_files() {
        let local = LocalObjectStore::new("/srv/media", "http://localhost/media");
        let probe = FfprobeProbe::new(Some(local));
        assert_eq!(
            probe.input_for("http://localhost/media/stories/a.mp4"),
            "/srv/media/stories/a.mp4"
        );
        assert_eq!(probe.input_for("https://cdn/x.mp4"), "https://cdn/x.mp4");
    }
}
