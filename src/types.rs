use crate::config::Config;
use crate::engine::FfmpegEngine;
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::ConversionService;
use crate::upload::HttpTransport;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Video bitrates, highest first. Indexed by ladder position.
pub const BITRATE_LADDER: [&str; 5] = ["8000k", "4000k", "2000k", "1000k", "500k"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "3840x2160")]
    Uhd2160,
    #[serde(rename = "2560x1440")]
    Qhd1440,
    #[serde(rename = "1920x1080")]
    Fhd1080,
    #[serde(rename = "1280x720")]
    Hd720,
    #[serde(rename = "854x480")]
    Sd480,
}

impl Resolution {
    /// Every supported resolution, largest first.
    pub const ALL: [Resolution; 5] = [
        Resolution::Uhd2160,
        Resolution::Qhd1440,
        Resolution::Fhd1080,
        Resolution::Hd720,
        Resolution::Sd480,
    ];

    pub fn width(&self) -> u32 {
        match self {
            Resolution::Uhd2160 => 3840,
            Resolution::Qhd1440 => 2560,
            Resolution::Fhd1080 => 1920,
            Resolution::Hd720 => 1280,
            Resolution::Sd480 => 854,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Resolution::Uhd2160 => 2160,
            Resolution::Qhd1440 => 1440,
            Resolution::Fhd1080 => 1080,
            Resolution::Hd720 => 720,
            Resolution::Sd480 => 480,
        }
    }

    /// `WIDTHxHEIGHT`, also used as the rendition directory name.
    pub fn label(&self) -> &'static str {
        match self {
            Resolution::Uhd2160 => "3840x2160",
            Resolution::Qhd1440 => "2560x1440",
            Resolution::Fhd1080 => "1920x1080",
            Resolution::Hd720 => "1280x720",
            Resolution::Sd480 => "854x480",
        }
    }

    fn rank(&self) -> usize {
        Resolution::ALL
            .iter()
            .position(|r| r == self)
            .unwrap_or(BITRATE_LADDER.len() - 1)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Resolution {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Resolution::ALL
            .into_iter()
            .find(|r| r.label() == s)
            .ok_or_else(|| PipelineError::InvalidJob(format!("unsupported resolution '{s}'")))
    }
}

/// How a rendition picks its entry in [`BITRATE_LADDER`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitratePolicy {
    /// The n-th requested resolution gets the n-th ladder bitrate.
    #[default]
    ByPosition,
    /// Each resolution gets the bitrate matching its own size.
    ByResolution,
}

impl BitratePolicy {
    pub fn bitrate_for(&self, position: usize, resolution: Resolution) -> &'static str {
        let index = match self {
            BitratePolicy::ByPosition => position,
            BitratePolicy::ByResolution => resolution.rank(),
        };
        BITRATE_LADDER[index.min(BITRATE_LADDER.len() - 1)]
    }
}

#[derive(Clone, Debug)]
pub struct SourceVideo {
    pub name: String,
    pub bytes: Bytes,
}

/// One submitted conversion request.
#[derive(Clone, Debug)]
pub struct ConversionJob {
    pub video: SourceVideo,
    pub resolutions: Vec<Resolution>,
    pub credential: Option<String>,
}

impl ConversionJob {
    pub fn new(
        video: SourceVideo,
        resolutions: Vec<Resolution>,
        credential: Option<String>,
    ) -> PipelineResult<Self> {
        let job = Self {
            video,
            resolutions,
            credential,
        };
        job.validate()?;
        Ok(job)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.resolutions.is_empty() {
            return Err(PipelineError::InvalidJob(
                "at least one resolution must be selected".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = self.resolutions.iter().find(|r| !seen.insert(**r)) {
            return Err(PipelineError::InvalidJob(format!(
                "resolution {dup} was selected more than once"
            )));
        }

        if self.video.bytes.is_empty() {
            return Err(PipelineError::InvalidJob("video file is empty".to_string()));
        }

        Ok(())
    }
}

pub const HLS_MANIFEST_MIME: &str = "application/vnd.apple.mpegurl";

/// Guess a MIME type from a file name, with the HLS extensions pinned.
pub fn infer_mime(name: &str) -> String {
    let lowercase = name.to_lowercase();
    if lowercase.ends_with(".m3u8") {
        HLS_MANIFEST_MIME.to_string()
    } else if lowercase.ends_with(".ts") {
        "video/mp2t".to_string()
    } else {
        mime_guess::from_path(name)
            .first_or_octet_stream()
            .to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenditionFile {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl RenditionFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        Self {
            mime_type: infer_mime(&name),
            name,
            data: data.into(),
        }
    }

    pub fn is_manifest(&self) -> bool {
        self.mime_type == HLS_MANIFEST_MIME
    }
}

/// All files produced by transcoding the source into one resolution.
///
/// Not `Clone`: each rendition is moved to its packaging task and dropped there.
#[derive(Debug)]
pub struct RenditionOutput {
    pub index: usize,
    pub resolution: Resolution,
    pub bitrate: &'static str,
    pub files: Vec<RenditionFile>,
}

impl RenditionOutput {
    #[cfg(test)]
    pub fn manifest(&self) -> Option<&RenditionFile> {
        self.files.iter().find(|f| f.is_manifest())
    }

    pub fn segment_count(&self) -> usize {
        self.files.iter().filter(|f| !f.is_manifest()).count()
    }

    pub fn total_bytes(&self) -> usize {
        self.files.iter().map(|f| f.data.len()).sum()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RenditionStatus {
    /// Position of the resolution in the submitted list.
    pub index: usize,
    pub resolution: String,
    pub content_id: Option<String>,
    pub url: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct JobProgress {
    pub job_id: String,
    pub video_name: Option<String>,
    pub status: JobStatus,
    pub stage: String,
    pub transcode_percentage: f64,
    pub upload_percentage: f64,
    pub renditions: Vec<RenditionStatus>,
    pub error: Option<String>,
    pub created_at: u64,
}

impl JobProgress {
    pub fn new(job_id: impl Into<String>, video_name: Option<String>, created_at: u64) -> Self {
        Self {
            job_id: job_id.into(),
            video_name,
            status: JobStatus::Queued,
            stage: "Queued".to_string(),
            transcode_percentage: 0.0,
            upload_percentage: 0.0,
            renditions: Vec::new(),
            error: None,
            created_at,
        }
    }
}

pub type ProgressMap = Arc<RwLock<HashMap<String, JobProgress>>>;

pub type Service = ConversionService<FfmpegEngine, HttpTransport>;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub progress: ProgressMap,
    pub service: Arc<Service>,
}

#[derive(Serialize)]
pub struct ConvertAccepted {
    pub job_id: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct ResolutionInfo {
    pub resolution: String,
    pub width: u32,
    pub height: u32,
    pub bitrate: String,
}
