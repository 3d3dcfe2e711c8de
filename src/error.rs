use thiserror::Error;

/// Failures of the conversion-and-upload pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The engine could not be initialized. Calling `ensure_loaded` again retries.
    #[error("failed to load transcoding engine: {0}")]
    EngineLoad(String),

    #[error("engine filesystem error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transcode failed for {target}: {diagnostic}")]
    Transcode { target: String, diagnostic: String },

    #[error("packaging failed: {0}")]
    Packaging(String),

    #[error("upload of chunk {chunk_index} failed: {reason}")]
    Upload { chunk_index: usize, reason: String },

    #[error("invalid conversion job: {0}")]
    InvalidJob(String),

    #[error("rendition task did not finish: {0}")]
    Aborted(String),
}

impl PipelineError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Short machine-readable label used in progress snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::EngineLoad(_) => "engine_load",
            PipelineError::Io { .. } => "io",
            PipelineError::Transcode { .. } => "transcode",
            PipelineError::Packaging(_) => "packaging",
            PipelineError::Upload { .. } => "upload",
            PipelineError::InvalidJob(_) => "invalid_job",
            PipelineError::Aborted(_) => "aborted",
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
