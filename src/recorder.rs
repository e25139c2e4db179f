//! Raw frame recording.
//!
//! Completed frames are copied out of their buffer and handed to a writer
//! task, which stores the image bytes as `frame_NNNNNN.raw` in one
//! directory. Copying first keeps recording from holding buffers back from
//! the capture queue.
//!
//! ```rust,ignore
//! let recorder = FrameRecorder::spawn(FrameWriter::create("out")?);
//! let sink = recorder.sink();
//! capture.register_frame_callback(move |frame| {
//!     sink.record(&frame);
//!     Ok(())
//! })?;
//! // ... start, stop, unregister the callback ...
//! let written = recorder.finish().await?;
//! ```

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use vmbx_core::frame::Frame;

/// File name of frame `id`, e.g. `frame_000042.raw`.
#[must_use]
pub fn frame_file_name(id: u64) -> String {
    format!("frame_{:06}.raw", id)
}

/// Writes image bytes into one directory.
#[derive(Debug, Clone)]
pub struct FrameWriter {
    dir: PathBuf,
}

impl FrameWriter {
    /// Use `dir`, creating it if needed.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Target directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `image` as the file of frame `id`, replacing an existing one.
    pub fn write(&self, id: u64, image: &[u8]) -> Result<PathBuf> {
        let path = self.dir.join(frame_file_name(id));
        let file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(image)
            .and_then(|()| writer.flush())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

/// Sending side of a [`FrameRecorder`]; cheap to clone into callbacks.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::UnboundedSender<(u64, Vec<u8>)>,
}

impl FrameSink {
    /// Queue a copy of `frame` for writing.
    ///
    /// Only `Completed` frames are recorded. Returns false for other frames
    /// and once the writer has stopped.
    pub fn record(&self, frame: &Frame) -> bool {
        if !frame.is_complete() {
            return false;
        }
        self.tx.send((frame.id(), frame.image().to_vec())).is_ok()
    }
}

/// Writer task fed through [`FrameSink`]s.
pub struct FrameRecorder {
    sink: FrameSink,
    task: JoinHandle<Result<u64>>,
}

impl FrameRecorder {
    /// Start the writer task. Needs a Tokio runtime.
    #[must_use]
    pub fn spawn(writer: FrameWriter) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(u64, Vec<u8>)>();
        let task = tokio::task::spawn_blocking(move || {
            let mut written = 0u64;
            while let Some((id, image)) = rx.blocking_recv() {
                let path = writer.write(id, &image)?;
                debug!(frame_id = id, path = %path.display(), "Frame written");
                written += 1;
            }
            Ok(written)
        });
        Self {
            sink: FrameSink { tx },
            task,
        }
    }

    /// A sink feeding this recorder.
    #[must_use]
    pub fn sink(&self) -> FrameSink {
        self.sink.clone()
    }

    /// Queue a copy of `frame`; see [`FrameSink::record`].
    pub fn record(&self, frame: &Frame) -> bool {
        self.sink.record(frame)
    }

    /// Write out everything queued and return the number of files written.
    ///
    /// Waits until every sink handed out by [`sink`](Self::sink) is dropped.
    /// The first write error ends recording and is returned here.
    pub async fn finish(self) -> Result<u64> {
        drop(self.sink);
        let written = self.task.await.context("Frame writer task panicked")??;
        info!(written, "Recording finished");
        Ok(written)
    }
}
