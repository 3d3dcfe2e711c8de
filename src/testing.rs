//! In-memory fakes for the engine and transport seams.

use crate::engine::{ProgressSender, TranscodeEngine};
use crate::error::{PipelineError, PipelineResult};
use crate::upload::{ChunkTransport, UploadChunk};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// Engine that "transcodes" by writing a manifest and `segments` fake segments
/// next to the output path named by the last argument.
pub struct ScriptedEngine {
    files: Mutex<BTreeMap<String, Bytes>>,
    calls: Mutex<Vec<String>>,
    runs: Mutex<Vec<Vec<String>>>,
    segments: usize,
    fail_on_run: Option<usize>,
}

impl ScriptedEngine {
    pub fn new(segments: usize) -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            runs: Mutex::new(Vec::new()),
            segments,
            fail_on_run: None,
        }
    }

    /// The `n`-th run (zero-based) fails with a diagnostic.
    pub fn failing_on_run(segments: usize, n: usize) -> Self {
        Self {
            fail_on_run: Some(n),
            ..Self::new(segments)
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn runs(&self) -> Vec<Vec<String>> {
        self.runs.lock().unwrap().clone()
    }

    pub fn file_names(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    fn log(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl TranscodeEngine for ScriptedEngine {
    async fn ensure_loaded(&self) -> PipelineResult<()> {
        self.log("ensure_loaded");
        Ok(())
    }

    async fn write_input(&self, name: &str, bytes: &[u8]) -> PipelineResult<()> {
        self.log("write_input");
        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), Bytes::copy_from_slice(bytes));
        Ok(())
    }

    async fn create_dir(&self, _name: &str) -> PipelineResult<()> {
        self.log("create_dir");
        Ok(())
    }

    async fn run(&self, args: &[String], progress: ProgressSender) -> PipelineResult<()> {
        self.log("run");
        let run_index = {
            let mut runs = self.runs.lock().unwrap();
            runs.push(args.to_vec());
            runs.len() - 1
        };

        let output = args.last().cloned().unwrap_or_default();
        if self.fail_on_run == Some(run_index) {
            return Err(PipelineError::Transcode {
                target: output,
                diagnostic: "Conversion failed!".to_string(),
            });
        }

        let dir = output
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_string())
            .unwrap_or_default();
        let _ = progress.send(0.5);
        {
            let mut files = self.files.lock().unwrap();
            files.insert(
                output.clone(),
                Bytes::from(format!("#EXTM3U\n#EXT-X-TARGETDURATION:6\n# {output}\n")),
            );
            for i in 0..self.segments {
                files.insert(
                    format!("{dir}/output_{i:03}.ts"),
                    Bytes::from(format!("segment {i} of {output}").into_bytes()),
                );
            }
        }
        let _ = progress.send(1.0);
        Ok(())
    }

    async fn list_outputs(&self, dir: &str) -> PipelineResult<Vec<String>> {
        self.log("list_outputs");
        let prefix = format!("{dir}/");
        Ok(self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    async fn read_output(&self, path: &str) -> PipelineResult<Bytes> {
        self.files.lock().unwrap().get(path).cloned().ok_or_else(|| {
            PipelineError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            )
        })
    }

    async fn remove_dir(&self, name: &str) -> PipelineResult<()> {
        self.log("remove_dir");
        let prefix = format!("{name}/");
        self.files
            .lock()
            .unwrap()
            .retain(|path, _| !path.starts_with(&prefix));
        Ok(())
    }

    async fn unload(&self) -> PipelineResult<()> {
        self.log("unload");
        self.files.lock().unwrap().clear();
        Ok(())
    }
}

/// Transport that keeps every chunk it is given and can fail one index.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<UploadChunk>>,
    attempted: Mutex<Vec<usize>>,
    credentials: Mutex<Vec<String>>,
    fail_on: Option<usize>,
    stall: Option<(Vec<u8>, Duration)>,
}

impl RecordingTransport {
    pub fn failing_on(index: usize) -> Self {
        Self {
            fail_on: Some(index),
            ..Self::default()
        }
    }

    /// Chunks whose bytes contain `marker` are held for `delay` before being accepted.
    pub fn stalling_on(marker: &str, delay: Duration) -> Self {
        Self {
            stall: Some((marker.as_bytes().to_vec(), delay)),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<UploadChunk> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempted(&self) -> Vec<usize> {
        self.attempted.lock().unwrap().clone()
    }

    pub fn credentials(&self) -> Vec<String> {
        self.credentials.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChunkTransport for RecordingTransport {
    async fn send_chunk(
        &self,
        chunk: UploadChunk,
        credential: &str,
        progress: ProgressSender,
    ) -> PipelineResult<()> {
        self.attempted.lock().unwrap().push(chunk.index);
        self.credentials.lock().unwrap().push(credential.to_string());
        if self.fail_on == Some(chunk.index) {
            return Err(PipelineError::Upload {
                chunk_index: chunk.index,
                reason: "storage service responded 500 Internal Server Error".to_string(),
            });
        }
        let _ = progress.send(0.5);
        if let Some((marker, delay)) = &self.stall {
            if chunk.data.windows(marker.len()).any(|w| w == marker.as_slice()) {
                tokio::time::sleep(*delay).await;
            }
        }
        self.sent.lock().unwrap().push(chunk);
        let _ = progress.send(1.0);
        Ok(())
    }
}
