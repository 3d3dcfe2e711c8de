use crate::config::EngineConfig;
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::{fs, process::Command};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Receives fractional progress (0.0..=1.0) for a single engine command.
/// The channel closes when the command finishes.
pub type ProgressSender = mpsc::UnboundedSender<f64>;

/// Transcoding engine with a private scratch filesystem.
///
/// Paths are relative to the engine's scratch root. Only one command runs at a
/// time; callers serialize their own sequencing on top of that.
#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    /// Initializes the engine once. Later calls return immediately; a failed
    /// load can be retried.
    async fn ensure_loaded(&self) -> PipelineResult<()>;

    async fn write_input(&self, name: &str, bytes: &[u8]) -> PipelineResult<()>;

    async fn create_dir(&self, name: &str) -> PipelineResult<()>;

    /// Runs one command to completion, streaming progress into `progress`.
    async fn run(&self, args: &[String], progress: ProgressSender) -> PipelineResult<()>;

    /// Names of the regular files directly under `dir`, sorted.
    async fn list_outputs(&self, dir: &str) -> PipelineResult<Vec<String>>;

    async fn read_output(&self, path: &str) -> PipelineResult<Bytes>;

    async fn remove_dir(&self, name: &str) -> PipelineResult<()>;

    async fn unload(&self) -> PipelineResult<()>;
}

/// Map a relative engine path onto `root`, refusing anything that escapes it.
pub fn resolve_path(root: &Path, name: &str) -> PipelineResult<PathBuf> {
    let relative = Path::new(name);
    let valid = !name.is_empty()
        && relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !valid {
        return Err(PipelineError::io(
            name,
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "path must be relative and stay inside the engine workspace",
            ),
        ));
    }
    Ok(root.join(relative))
}

/// Turn one line of ffmpeg `-progress` output into a completion fraction.
pub fn parse_progress_line(line: &str, duration_us: Option<f64>) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "progress" if value == "end" => Some(1.0),
        // ffmpeg reports microseconds under both keys
        "out_time_us" | "out_time_ms" => {
            let total = duration_us.filter(|d| *d > 0.0)?;
            let elapsed: f64 = value.parse().ok()?;
            Some((elapsed / total).clamp(0.0, 1.0))
        }
        _ => None,
    }
}

fn input_of(args: &[String]) -> Option<&str> {
    args.iter()
        .position(|arg| arg == "-i")
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// ffmpeg/ffprobe executables operating inside a scratch directory.
pub struct FfmpegEngine {
    config: EngineConfig,
    root: PathBuf,
    loaded: Mutex<bool>,
    permit: Semaphore,
    durations: Mutex<HashMap<String, f64>>,
}

impl FfmpegEngine {
    pub fn new(config: EngineConfig) -> Self {
        let base = config
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let root = base.join(format!("hls-engine-{}", Uuid::new_v4()));
        Self {
            config,
            root,
            loaded: Mutex::new(false),
            permit: Semaphore::new(1),
            durations: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn check_binary(&self, binary: &str) -> PipelineResult<String> {
        let output = Command::new(binary)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| PipelineError::EngineLoad(format!("failed to run {binary}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::EngineLoad(format!(
                "{binary} -version exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().to_string())
    }

    /// Duration of a media file in seconds, read with ffprobe's JSON output.
    async fn probe_duration(&self, path: &Path) -> Option<f64> {
        let output = Command::new(&self.config.ffprobe_path)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("json")
            .arg(path)
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }

        let v: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
        v["format"]["duration"]
            .as_str()
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| *d > 0.0)
    }

    async fn require_loaded(&self) -> PipelineResult<()> {
        if *self.loaded.lock().await {
            Ok(())
        } else {
            Err(PipelineError::EngineLoad("engine is not loaded".to_string()))
        }
    }
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    async fn ensure_loaded(&self) -> PipelineResult<()> {
        let mut loaded = self.loaded.lock().await;
        if *loaded {
            return Ok(());
        }

        let ffmpeg_version = self.check_binary(&self.config.ffmpeg_path).await?;
        self.check_binary(&self.config.ffprobe_path).await?;

        fs::create_dir_all(&self.root).await.map_err(|e| {
            PipelineError::EngineLoad(format!("failed to create {:?}: {e}", self.root))
        })?;

        info!(version = %ffmpeg_version, root = ?self.root, "Transcoding engine loaded");
        *loaded = true;
        Ok(())
    }

    async fn write_input(&self, name: &str, bytes: &[u8]) -> PipelineResult<()> {
        self.require_loaded().await?;
        let path = resolve_path(&self.root, name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::io(name, e))?;
        }
        fs::write(&path, bytes)
            .await
            .map_err(|e| PipelineError::io(name, e))?;

        match self.probe_duration(&path).await {
            Some(duration) => {
                debug!(input = name, duration, "Probed input duration");
                self.durations
                    .lock()
                    .await
                    .insert(name.to_string(), duration);
            }
            None => warn!(
                input = name,
                "Could not probe input duration, progress will only report completion"
            ),
        }

        Ok(())
    }

    async fn create_dir(&self, name: &str) -> PipelineResult<()> {
        self.require_loaded().await?;
        let path = resolve_path(&self.root, name)?;
        fs::create_dir_all(&path)
            .await
            .map_err(|e| PipelineError::io(name, e))
    }

    async fn run(&self, args: &[String], progress: ProgressSender) -> PipelineResult<()> {
        self.require_loaded().await?;
        let _permit = self
            .permit
            .acquire()
            .await
            .map_err(|_| PipelineError::EngineLoad("engine was shut down".to_string()))?;

        let target = args.last().cloned().unwrap_or_default();
        let duration_us = match input_of(args) {
            Some(input) => self
                .durations
                .lock()
                .await
                .get(input)
                .map(|seconds| seconds * 1_000_000.0),
            None => None,
        };

        let mut cmd = Command::new(&self.config.ffmpeg_path);
        cmd.current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .arg("-hide_banner")
            .arg("-nostats")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-progress")
            .arg("pipe:1")
            .args(args);

        let mut child = cmd.spawn().map_err(|e| PipelineError::Transcode {
            target: target.clone(),
            diagnostic: format!("failed to spawn ffmpeg: {e}"),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let progress_task = async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(fraction) = parse_progress_line(&line, duration_us) {
                    let _ = progress.send(fraction);
                }
            }
        };

        let stderr_task = async move {
            let mut diagnostic = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut diagnostic).await;
            }
            diagnostic
        };

        let ((), diagnostic) = tokio::join!(progress_task, stderr_task);

        let status = child
            .wait()
            .await
            .map_err(|e| PipelineError::io(target.clone(), e))?;

        if !status.success() {
            let diagnostic = diagnostic.trim();
            error!(output = %target, %status, "ffmpeg failed: {}", diagnostic);
            return Err(PipelineError::Transcode {
                target,
                diagnostic: if diagnostic.is_empty() {
                    format!("ffmpeg exited with {status}")
                } else {
                    diagnostic.to_string()
                },
            });
        }

        Ok(())
    }

    async fn list_outputs(&self, dir: &str) -> PipelineResult<Vec<String>> {
        let path = resolve_path(&self.root, dir)?;
        let mut read_dir = fs::read_dir(&path)
            .await
            .map_err(|e| PipelineError::io(dir, e))?;

        let mut names = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| PipelineError::io(dir, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| PipelineError::io(dir, e))?;
            if !file_type.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read_output(&self, path: &str) -> PipelineResult<Bytes> {
        let full = resolve_path(&self.root, path)?;
        fs::read(&full)
            .await
            .map(Bytes::from)
            .map_err(|e| PipelineError::io(path, e))
    }

    async fn remove_dir(&self, name: &str) -> PipelineResult<()> {
        let path = resolve_path(&self.root, name)?;
        self.durations
            .lock()
            .await
            .retain(|input, _| !Path::new(input).starts_with(name));
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::io(name, e)),
        }
    }

    async fn unload(&self) -> PipelineResult<()> {
        let mut loaded = self.loaded.lock().await;
        if !*loaded {
            return Ok(());
        }
        let _permit = self
            .permit
            .acquire()
            .await
            .map_err(|_| PipelineError::EngineLoad("engine was shut down".to_string()))?;

        self.durations.lock().await.clear();
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PipelineError::io(self.root.to_string_lossy(), e)),
        }
        *loaded = false;
        info!(root = ?self.root, "Transcoding engine unloaded");
        Ok(())
    }
}
