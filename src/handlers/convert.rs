use crate::engine::TranscodeEngine;
use crate::error::PipelineResult;
use crate::handlers::common::{bad_request, now_millis};
use crate::pipeline::ConversionService;
use crate::progress::ProgressReporter;
use crate::types::{
    AppState, ConversionJob, ConvertAccepted, JobProgress, JobStatus, ProgressMap, Resolution,
    ResolutionInfo, SourceVideo,
};
use crate::upload::ChunkTransport;

use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// How long an SSE client may wait for an unknown job id to appear.
const UNKNOWN_JOB_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Video parts are accepted by MIME type, or by extension for Matroska which
/// browsers often send without one.
pub fn is_video_upload(content_type: Option<&str>, file_name: &str) -> bool {
    content_type.is_some_and(|ct| ct.starts_with("video/"))
        || file_name.to_lowercase().ends_with(".mkv")
}

/// Accepts a JSON array of labels or a comma separated list.
pub fn parse_resolutions(text: &str) -> PipelineResult<Vec<Resolution>> {
    let labels = match serde_json::from_str::<Vec<String>>(text) {
        Ok(labels) => labels,
        Err(_) => text
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    };
    labels.iter().map(|label| label.parse()).collect()
}

pub async fn convert_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ConvertAccepted>, (StatusCode, String)> {
    let mut video: Option<SourceVideo> = None;
    let mut resolutions: Option<Vec<Resolution>> = None;
    let mut api_key: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {e}")))?
    {
        let field_name = field.name().map(|s| s.to_string());

        match field_name.as_deref() {
            Some("file") => {
                let file_name = field
                    .file_name()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "upload.mp4".to_string());
                let content_type = field.content_type().map(|s| s.to_string());
                if !is_video_upload(content_type.as_deref(), &file_name) {
                    return Err(bad_request(format!(
                        "'{file_name}' is not a video file"
                    )));
                }

                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("failed to read file: {e}")))?;
                video = Some(SourceVideo {
                    name: file_name,
                    bytes,
                });
            }
            Some("resolutions") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("failed to read resolutions: {e}")))?;
                resolutions = Some(parse_resolutions(&text).map_err(|e| bad_request(e.to_string()))?);
            }
            Some("api_key") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("failed to read api_key: {e}")))?;
                api_key = Some(text.trim().to_string()).filter(|k| !k.is_empty());
            }
            _ => {
                continue;
            }
        }
    }

    let video = video.ok_or_else(|| bad_request("missing file field 'file'"))?;
    let resolutions = resolutions.ok_or_else(|| bad_request("missing field 'resolutions'"))?;
    let job = ConversionJob::new(video, resolutions, api_key)
        .map_err(|e| bad_request(e.to_string()))?;

    let job_id = Uuid::new_v4().to_string();
    state.progress.write().await.insert(
        job_id.clone(),
        JobProgress::new(job_id.clone(), Some(job.video.name.clone()), now_millis()),
    );

    info!(
        job_id = %job_id,
        video = %job.video.name,
        bytes = job.video.bytes.len(),
        resolutions = ?job.resolutions,
        "Conversion queued"
    );

    tokio::spawn(run_job(
        state.service.clone(),
        state.progress.clone(),
        Duration::from_secs(state.config.server.progress_retention_secs),
        job_id.clone(),
        job,
    ));

    Ok(Json(ConvertAccepted {
        job_id,
        message: "Conversion started".to_string(),
    }))
}

/// Drive one job to a terminal status, then drop its progress entry once
/// `retention` has passed.
async fn run_job<E, T>(
    service: Arc<ConversionService<E, T>>,
    progress: ProgressMap,
    retention: Duration,
    job_id: String,
    job: ConversionJob,
) where
    E: TranscodeEngine + 'static,
    T: ChunkTransport + 'static,
{
    let reporter = ProgressReporter::new(progress.clone(), job_id.clone());
    match service.convert(&job_id, job, &reporter).await {
        Ok(report) if report.is_success() => {
            info!(job_id = %job_id, content_ids = ?report.content_ids(), "Conversion completed");
            reporter.finish(JobStatus::Completed, None).await;
        }
        Ok(report) => {
            let failures: Vec<String> = report
                .failures()
                .filter_map(|u| u.result.as_ref().err().map(|e| format!("{}: {e}", u.resolution)))
                .collect();
            warn!(job_id = %job_id, failed = failures.len(), "Conversion finished with failed uploads");
            reporter
                .finish(JobStatus::Failed, Some(failures.join("; ")))
                .await;
        }
        Err(e) => {
            error!(job_id = %job_id, kind = e.kind(), error = %e, "Conversion failed");
            reporter.finish(JobStatus::Failed, Some(e.to_string())).await;
        }
    }

    tokio::time::sleep(retention).await;
    progress.write().await.remove(&job_id);
    debug!(job_id = %job_id, "Job progress evicted");
}

pub async fn get_progress(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, anyhow::Error>> + Send> {
    let stream = async_stream::stream! {
        let start_time = std::time::Instant::now();

        loop {
            let progress = {
                let progress_map = state.progress.read().await;
                progress_map.get(&job_id).cloned()
            };

            if let Some(p) = progress {
                let json = serde_json::to_string(&p).unwrap_or_default();
                yield Ok(Event::default().data(json));

                if p.status.is_terminal() {
                    // give the client a moment to read the final event
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    break;
                }
            } else if start_time.elapsed() > UNKNOWN_JOB_TIMEOUT {
                yield Ok(Event::default().event("error").data("Job ID not found (timeout)"));
                break;
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobProgress>, (StatusCode, String)> {
    state
        .progress
        .read()
        .await
        .get(&job_id)
        .cloned()
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Job not found".to_string()))
}

pub async fn list_resolutions(State(state): State<AppState>) -> Json<Vec<ResolutionInfo>> {
    let policy = state.config.engine.bitrate_policy;
    Json(
        Resolution::ALL
            .iter()
            .enumerate()
            .map(|(position, resolution)| ResolutionInfo {
                resolution: resolution.label().to_string(),
                width: resolution.width(),
                height: resolution.height(),
                bitrate: policy.bitrate_for(position, *resolution).to_string(),
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::FfmpegEngine;
    use crate::testing::{RecordingTransport, ScriptedEngine};
    use crate::transcode::ResolutionJobRunner;
    use crate::types::BitratePolicy;
    use crate::upload::{ChunkedUploader, HttpTransport};
    use axum::Router;
    use axum::routing::post;
    use bytes::Bytes;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    fn state() -> AppState {
        let config = Config::from_yaml(
            "server: {host: 127.0.0.1, port: 0}\n\
             storage: {base_url: 'http://127.0.0.1:9'}\n\
             engine: {ffmpeg_path: /nonexistent/ffmpeg, ffprobe_path: /nonexistent/ffprobe}\n",
            Some("tok".to_string()),
        )
        .unwrap();
        let engine = Arc::new(FfmpegEngine::new(config.engine.clone()));
        let runner = ResolutionJobRunner::new(engine, config.engine.bitrate_policy);
        let uploader = ChunkedUploader::new(
            HttpTransport::new(&config.storage.base_url).unwrap(),
            config.storage.max_chunk_size,
            config.storage.token.clone(),
        );
        let service = ConversionService::new(runner, uploader, config.storage.gateway_url.clone());
        AppState {
            config,
            progress: Arc::new(RwLock::new(HashMap::new())),
            service: Arc::new(service),
        }
    }

    fn scripted_service(
        engine: ScriptedEngine,
        transport: RecordingTransport,
    ) -> Arc<ConversionService<ScriptedEngine, RecordingTransport>> {
        Arc::new(ConversionService::new(
            ResolutionJobRunner::new(Arc::new(engine), BitratePolicy::ByPosition),
            ChunkedUploader::new(transport, 1 << 20, "tok"),
            "https://gateway.test",
        ))
    }

    fn job(resolutions: Vec<Resolution>) -> ConversionJob {
        ConversionJob {
            video: SourceVideo {
                name: "clip.mp4".to_string(),
                bytes: Bytes::from_static(b"fake video"),
            },
            resolutions,
            credential: None,
        }
    }

    async fn wait_for_terminal(progress: &ProgressMap, job_id: &str) -> JobProgress {
        for _ in 0..500 {
            if let Some(p) = progress.read().await.get(job_id) {
                if p.status.is_terminal() {
                    return p.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached a terminal status");
    }

    #[test]
    fn test_video_detection() {
        assert!(is_video_upload(Some("video/mp4"), "clip.mp4"));
        assert!(is_video_upload(None, "Movie.MKV"));
        assert!(is_video_upload(Some("application/octet-stream"), "movie.mkv"));
        assert!(!is_video_upload(Some("image/png"), "clip.png"));
        assert!(!is_video_upload(None, "clip.mp4"));
    }

    #[test]
    fn test_parse_resolutions_json_and_comma_forms() {
        assert_eq!(
            parse_resolutions(r#"["1920x1080", "1280x720"]"#).unwrap(),
            vec![Resolution::Fhd1080, Resolution::Hd720]
        );
        assert_eq!(
            parse_resolutions("854x480, 3840x2160,").unwrap(),
            vec![Resolution::Sd480, Resolution::Uhd2160]
        );
        assert!(parse_resolutions("").unwrap().is_empty());
        assert!(parse_resolutions("640x360").is_err());
    }

    #[tokio::test]
    async fn test_get_job_returns_snapshot_or_404() {
        let state = state();
        let missing = get_job(State(state.clone()), Path("nope".to_string())).await;
        assert_eq!(missing.unwrap_err().0, StatusCode::NOT_FOUND);

        state.progress.write().await.insert(
            "job-1".to_string(),
            JobProgress::new("job-1", Some("clip.mp4".to_string()), 1),
        );
        let Json(found) = get_job(State(state), Path("job-1".to_string()))
            .await
            .unwrap();
        assert_eq!(found.status, JobStatus::Queued);
        assert_eq!(found.video_name.as_deref(), Some("clip.mp4"));
    }

    #[tokio::test]
    async fn test_list_resolutions_uses_ladder() {
        let Json(list) = list_resolutions(State(state())).await;
        assert_eq!(list.len(), 5);
        assert_eq!(list[0].resolution, "3840x2160");
        assert_eq!(list[0].bitrate, "8000k");
        assert_eq!(list[4].resolution, "854x480");
        assert_eq!(list[4].bitrate, "500k");
    }

    #[tokio::test]
    async fn test_completed_job_lists_renditions_then_is_evicted() {
        let progress: ProgressMap = Arc::new(RwLock::new(HashMap::new()));
        let service = scripted_service(
            ScriptedEngine::new(2),
            RecordingTransport::stalling_on("1920x1080", Duration::from_millis(200)),
        );

        let handle = tokio::spawn(run_job(
            service,
            progress.clone(),
            Duration::from_millis(500),
            "job-ok".to_string(),
            job(vec![Resolution::Fhd1080, Resolution::Hd720]),
        ));

        let done = wait_for_terminal(&progress, "job-ok").await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.stage, "Completed");
        assert_eq!(done.error, None);
        assert_eq!(done.upload_percentage, 100.0);
        let listed: Vec<&str> = done.renditions.iter().map(|r| r.resolution.as_str()).collect();
        assert_eq!(listed, vec!["1920x1080", "1280x720"]);
        for rendition in &done.renditions {
            let cid = rendition.content_id.as_deref().unwrap();
            assert_eq!(rendition.url, Some(format!("https://gateway.test/ipfs/{cid}")));
        }

        handle.await.unwrap();
        assert!(!progress.read().await.contains_key("job-ok"));
    }

    #[tokio::test]
    async fn test_failed_uploads_are_summarised() {
        let progress: ProgressMap = Arc::new(RwLock::new(HashMap::new()));
        let service = scripted_service(ScriptedEngine::new(1), RecordingTransport::failing_on(0));

        let handle = tokio::spawn(run_job(
            service,
            progress.clone(),
            Duration::from_secs(60),
            "job-bad".to_string(),
            job(vec![Resolution::Hd720, Resolution::Sd480]),
        ));

        let done = wait_for_terminal(&progress, "job-bad").await;
        handle.abort();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.stage, "Failed");
        let reason = "upload of chunk 0 failed: storage service responded 500 Internal Server Error";
        assert_eq!(
            done.error.as_deref(),
            Some(format!("1280x720: {reason}; 854x480: {reason}").as_str())
        );
        assert!(done.renditions.iter().all(|r| r.content_id.is_none()));
    }

    #[tokio::test]
    async fn test_transcode_failure_fails_the_job() {
        let progress: ProgressMap = Arc::new(RwLock::new(HashMap::new()));
        let service = scripted_service(
            ScriptedEngine::failing_on_run(1, 0),
            RecordingTransport::default(),
        );

        let handle = tokio::spawn(run_job(
            service,
            progress.clone(),
            Duration::from_secs(60),
            "job-broken".to_string(),
            job(vec![Resolution::Fhd1080]),
        ));

        let done = wait_for_terminal(&progress, "job-broken").await;
        handle.abort();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(
            done.error.as_deref(),
            Some("transcode failed for 1920x1080: Conversion failed!")
        );
        assert!(done.renditions.is_empty());
    }

    const BOUNDARY: &str = "conversion-test-boundary";

    /// `(field, Some((file name, content type)), value)` parts as a multipart body.
    fn multipart_body(parts: &[(&str, Option<(&str, &str)>, &str)]) -> String {
        let mut body = String::new();
        for (name, file, value) in parts {
            body.push_str(&format!("--{BOUNDARY}\r\n"));
            match file {
                Some((file_name, content_type)) => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                     Content-Type: {content_type}\r\n\r\n"
                )),
                None => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"
                )),
            }
            body.push_str(value);
            body.push_str("\r\n");
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));
        body
    }

    async fn serve(state: AppState) -> String {
        let app = Router::new()
            .route("/api/convert", post(convert_video))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/api/convert")
    }

    async fn post_form(url: &str, body: String) -> (reqwest::StatusCode, String) {
        let response = reqwest::Client::new()
            .post(url)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.text().await.unwrap())
    }

    #[tokio::test]
    async fn test_convert_rejects_bad_forms() {
        let url = serve(state()).await;

        let (status, text) = post_form(
            &url,
            multipart_body(&[
                ("file", Some(("cover.png", "image/png")), "png bytes"),
                ("resolutions", None, r#"["1280x720"]"#),
            ]),
        )
        .await;
        assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
        assert!(text.contains("'cover.png' is not a video file"));

        let (status, text) = post_form(
            &url,
            multipart_body(&[("file", Some(("clip.mp4", "video/mp4")), "mp4 bytes")]),
        )
        .await;
        assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(text, "missing field 'resolutions'");

        let (status, text) = post_form(&url, multipart_body(&[("resolutions", None, "1280x720")])).await;
        assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(text, "missing file field 'file'");

        let (status, text) = post_form(
            &url,
            multipart_body(&[
                ("file", Some(("clip.mp4", "video/mp4")), "mp4 bytes"),
                ("resolutions", None, "[]"),
            ]),
        )
        .await;
        assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
        assert!(text.contains("at least one resolution"));
    }

    #[tokio::test]
    async fn test_convert_queues_job_and_reports_engine_failure() {
        let state = state();
        let url = serve(state.clone()).await;

        let (status, text) = post_form(
            &url,
            multipart_body(&[
                ("file", Some(("clip.mkv", "application/octet-stream")), "mkv bytes"),
                ("resolutions", None, "1920x1080, 854x480"),
                ("api_key", None, "  "),
                ("comment", None, "ignored"),
            ]),
        )
        .await;
        assert_eq!(status, reqwest::StatusCode::OK);
        let accepted: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(accepted["message"], "Conversion started");
        let job_id = accepted["job_id"].as_str().unwrap().to_string();

        let done = wait_for_terminal(&state.progress, &job_id).await;
        assert_eq!(done.video_name.as_deref(), Some("clip.mkv"));
        assert_eq!(done.status, JobStatus::Failed);
        assert!(
            done.error
                .as_deref()
                .unwrap()
                .starts_with("failed to load transcoding engine")
        );
    }
}
