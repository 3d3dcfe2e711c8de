use crate::engine::TranscodeEngine;
use crate::error::{PipelineError, PipelineResult};
use crate::progress::{Phase, ProgressReporter, ProgressTracker};
use crate::types::{BitratePolicy, RenditionFile, RenditionOutput, Resolution, SourceVideo};
use futures::future::try_join_all;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const MANIFEST_NAME: &str = "output.m3u8";
pub const SEGMENT_PATTERN: &str = "output_%03d.ts";

/// ffmpeg arguments producing one HLS rendition inside `dir`.
pub fn hls_args(input: &str, dir: &str, resolution: Resolution, bitrate: &str) -> Vec<String> {
    let scale = format!("scale={}", resolution.label());
    let segment_path = format!("{dir}/{SEGMENT_PATTERN}");
    let manifest_path = format!("{dir}/{MANIFEST_NAME}");
    [
        "-i",
        input,
        "-vf",
        scale.as_str(),
        "-b:v",
        bitrate,
        "-c:v",
        "libx264",
        "-g",
        "30",
        "-c:a",
        "aac",
        "-f",
        "hls",
        "-hls_time",
        "6",
        "-hls_list_size",
        "0",
        "-hls_segment_filename",
        segment_path.as_str(),
        manifest_path.as_str(),
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

/// Scratch name for the uploaded source, keeping a plain extension if it has one.
fn input_name(video_name: &str) -> String {
    let ext = Path::new(video_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "mp4".to_string());
    format!("input.{ext}")
}

/// Drives the engine through one HLS transcode per requested resolution.
pub struct ResolutionJobRunner<E> {
    engine: Arc<E>,
    policy: BitratePolicy,
}

impl<E: TranscodeEngine> ResolutionJobRunner<E> {
    pub fn new(engine: Arc<E>, policy: BitratePolicy) -> Self {
        Self { engine, policy }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Transcode `video` into every resolution, strictly one after another.
    ///
    /// Each finished rendition is moved into `on_rendition` before the next
    /// resolution starts, so callers can package and upload it while the
    /// engine keeps working. Nothing is retained here; the return value is the
    /// number of renditions delivered. A failed run stops the remaining
    /// resolutions.
    pub async fn transcode<F>(
        &self,
        workspace: &str,
        video: &SourceVideo,
        resolutions: &[Resolution],
        reporter: &ProgressReporter,
        mut on_rendition: F,
    ) -> PipelineResult<usize>
    where
        F: FnMut(RenditionOutput) + Send,
    {
        if resolutions.is_empty() {
            return Err(PipelineError::InvalidJob(
                "at least one resolution must be selected".to_string(),
            ));
        }

        if self.policy == BitratePolicy::ByPosition
            && resolutions.windows(2).any(|w| w[0].height() <= w[1].height())
        {
            warn!(
                ?resolutions,
                "Resolutions are not in descending order, bitrates follow list position"
            );
        }

        self.engine.ensure_loaded().await?;

        let input = format!("{workspace}/{}", input_name(&video.name));
        self.engine.write_input(&input, &video.bytes).await?;
        info!(
            video = %video.name,
            bytes = video.bytes.len(),
            renditions = resolutions.len(),
            "Source staged for transcoding"
        );

        let mut tracker = ProgressTracker::new(resolutions.len());
        let mut delivered = 0;

        for (index, &resolution) in resolutions.iter().enumerate() {
            let label = resolution.label();
            let bitrate = self.policy.bitrate_for(index, resolution);
            let dir = format!("{workspace}/{label}");

            reporter.stage(&format!("Transcoding {label}")).await;
            self.engine.create_dir(&dir).await?;

            let args = hls_args(&input, &dir, resolution, bitrate);
            debug!(resolution = label, bitrate, ?args, "Starting transcode");

            let (tx, mut rx) = mpsc::unbounded_channel();
            let run = self.engine.run(&args, tx);
            tokio::pin!(run);

            let result = loop {
                tokio::select! {
                    result = &mut run => break result,
                    Some(fraction) = rx.recv() => {
                        tracker.record(index, fraction);
                        reporter.report(Phase::Transcode, tracker.percentage()).await;
                    }
                }
            };
            while let Ok(fraction) = rx.try_recv() {
                tracker.record(index, fraction);
            }

            if let Err(e) = result {
                error!(resolution = label, error = %e, "Transcode failed, skipping remaining resolutions");
                return Err(match e {
                    PipelineError::Transcode { diagnostic, .. } => PipelineError::Transcode {
                        target: label.to_string(),
                        diagnostic,
                    },
                    other => other,
                });
            }

            tracker.record(index, 1.0);
            reporter.report(Phase::Transcode, tracker.percentage()).await;

            let rendition = self.collect(index, resolution, bitrate, &dir).await?;
            info!(
                resolution = label,
                bitrate,
                segments = rendition.segment_count(),
                bytes = rendition.total_bytes(),
                "Rendition transcoded"
            );

            on_rendition(rendition);
            delivered += 1;
        }

        Ok(delivered)
    }

    async fn collect(
        &self,
        index: usize,
        resolution: Resolution,
        bitrate: &'static str,
        dir: &str,
    ) -> PipelineResult<RenditionOutput> {
        let names = self.engine.list_outputs(dir).await?;
        let files = try_join_all(names.into_iter().map(|name| async move {
            let data = self.engine.read_output(&format!("{dir}/{name}")).await?;
            Ok::<_, PipelineError>(RenditionFile::new(name, data))
        }))
        .await?;

        let manifests = files.iter().filter(|f| f.is_manifest()).count();
        if manifests != 1 {
            return Err(PipelineError::Transcode {
                target: resolution.label().to_string(),
                diagnostic: format!("expected exactly one manifest, found {manifests}"),
            });
        }

        Ok(RenditionOutput {
            index,
            resolution,
            bitrate,
            files,
        })
    }

    /// Remove everything staged under `workspace`.
    pub async fn cleanup(&self, workspace: &str) -> PipelineResult<()> {
        self.engine.remove_dir(workspace).await
    }
}
