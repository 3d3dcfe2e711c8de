use crate::archive;
use crate::engine::TranscodeEngine;
use crate::error::{PipelineError, PipelineResult};
use crate::progress::{Phase, ProgressReporter, ProgressTracker};
use crate::transcode::ResolutionJobRunner;
use crate::types::{ConversionJob, RenditionOutput, RenditionStatus, Resolution};
use crate::upload::{ChunkTransport, ChunkedUploader};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub fn gateway_link(gateway_url: &str, content_id: &str) -> String {
    format!("{}/ipfs/{content_id}", gateway_url.trim_end_matches('/'))
}

/// Outcome of packaging and uploading one rendition.
#[derive(Debug)]
pub struct RenditionUpload {
    pub resolution: Resolution,
    pub result: PipelineResult<String>,
}

/// Per-rendition results of a job, in the order the resolutions were requested.
#[derive(Debug)]
pub struct JobReport {
    pub uploads: Vec<RenditionUpload>,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        self.uploads.iter().all(|u| u.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &RenditionUpload> {
        self.uploads.iter().filter(|u| u.result.is_err())
    }

    /// Content ids of the successful uploads, in requested order.
    pub fn content_ids(&self) -> Vec<&str> {
        self.uploads
            .iter()
            .filter_map(|u| u.result.as_deref().ok())
            .collect()
    }
}

/// Transcodes a job and ships every rendition to storage as it finishes.
pub struct ConversionService<E, T> {
    runner: ResolutionJobRunner<E>,
    uploader: Arc<ChunkedUploader<T>>,
    gateway_url: String,
}

impl<E, T> ConversionService<E, T>
where
    E: TranscodeEngine + 'static,
    T: ChunkTransport + 'static,
{
    pub fn new(
        runner: ResolutionJobRunner<E>,
        uploader: ChunkedUploader<T>,
        gateway_url: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            uploader: Arc::new(uploader),
            gateway_url: gateway_url.into(),
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        self.runner.engine()
    }

    /// Run `job` to the end.
    ///
    /// Uploads of finished renditions overlap with transcoding of the next
    /// one. Every upload is awaited, including after a transcode failure, in
    /// which case the transcode error is returned once they are done.
    pub async fn convert(
        &self,
        job_id: &str,
        job: ConversionJob,
        reporter: &ProgressReporter,
    ) -> PipelineResult<JobReport> {
        job.validate()?;
        reporter.start().await;

        let count = job.resolutions.len();
        let upload_tracker = Arc::new(Mutex::new(ProgressTracker::new(count)));
        let mut handles: Vec<(Resolution, JoinHandle<PipelineResult<String>>)> =
            Vec::with_capacity(count);

        info!(
            job_id,
            video = %job.video.name,
            resolutions = ?job.resolutions,
            "Conversion started"
        );

        let transcoded = self
            .runner
            .transcode(
                job_id,
                &job.video,
                &job.resolutions,
                reporter,
                |rendition| {
                    let resolution = rendition.resolution;
                    let handle = tokio::spawn(deliver(
                        self.uploader.clone(),
                        rendition,
                        job.credential.clone(),
                        upload_tracker.clone(),
                        reporter.clone(),
                        self.gateway_url.clone(),
                    ));
                    handles.push((resolution, handle));
                },
            )
            .await;

        if let Err(e) = self.runner.cleanup(job_id).await {
            warn!(job_id, error = %e, "Failed to clean engine workspace");
        }
        if let Ok(delivered) = &transcoded {
            debug!(job_id, delivered, "All renditions transcoded");
            reporter.stage("Uploading").await;
        }

        let mut uploads = Vec::with_capacity(handles.len());
        for (resolution, handle) in handles {
            let result = handle
                .await
                .unwrap_or_else(|e| Err(PipelineError::Aborted(e.to_string())));
            uploads.push(RenditionUpload { resolution, result });
        }

        if let Err(e) = transcoded {
            for upload in &uploads {
                match &upload.result {
                    Ok(cid) => info!(
                        job_id,
                        resolution = %upload.resolution,
                        content_id = %cid,
                        "Rendition uploaded before transcode failure"
                    ),
                    Err(err) => warn!(
                        job_id,
                        resolution = %upload.resolution,
                        error = %err,
                        "Rendition upload failed"
                    ),
                }
            }
            return Err(e);
        }

        let report = JobReport { uploads };
        info!(
            job_id,
            renditions = report.uploads.len(),
            failed = report.failures().count(),
            "Conversion finished"
        );
        Ok(report)
    }
}

/// Package one rendition and upload it, publishing progress and the outcome.
async fn deliver<T: ChunkTransport + 'static>(
    uploader: Arc<ChunkedUploader<T>>,
    rendition: RenditionOutput,
    credential: Option<String>,
    tracker: Arc<Mutex<ProgressTracker>>,
    reporter: ProgressReporter,
    gateway_url: String,
) -> PipelineResult<String> {
    let index = rendition.index;
    let label = rendition.resolution.label();
    let bitrate = rendition.bitrate;

    let result = package_and_upload(
        &uploader,
        rendition,
        credential.as_deref(),
        &tracker,
        &reporter,
    )
    .await;

    let status = match &result {
        Ok(content_id) => {
            let mut tracker = tracker.lock().await;
            tracker.record(index, 1.0);
            reporter.report(Phase::Upload, tracker.percentage()).await;
            info!(
                job_id = reporter.job_id(),
                resolution = label,
                bitrate,
                content_id = %content_id,
                "Rendition delivered"
            );
            RenditionStatus {
                index,
                resolution: label.to_string(),
                content_id: Some(content_id.clone()),
                url: Some(gateway_link(&gateway_url, content_id)),
                error: None,
            }
        }
        Err(e) => {
            error!(
                job_id = reporter.job_id(),
                resolution = label,
                error = %e,
                "Rendition delivery failed"
            );
            RenditionStatus {
                index,
                resolution: label.to_string(),
                content_id: None,
                url: None,
                error: Some(e.to_string()),
            }
        }
    };
    reporter.rendition_finished(status).await;
    result
}

async fn package_and_upload<T: ChunkTransport>(
    uploader: &ChunkedUploader<T>,
    rendition: RenditionOutput,
    credential: Option<&str>,
    tracker: &Mutex<ProgressTracker>,
    reporter: &ProgressReporter,
) -> PipelineResult<String> {
    let index = rendition.index;
    let files = rendition.files;
    let archive = tokio::task::spawn_blocking(move || archive::package(&files))
        .await
        .map_err(|e| PipelineError::Aborted(e.to_string()))??;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let upload = uploader.upload(archive, credential, tx);
    tokio::pin!(upload);

    loop {
        tokio::select! {
            result = &mut upload => return result,
            Some(fraction) = rx.recv() => {
                let mut tracker = tracker.lock().await;
                tracker.record(index, fraction);
                reporter.report(Phase::Upload, tracker.percentage()).await;
            }
        }
    }
}
