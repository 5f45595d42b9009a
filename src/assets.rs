//! Access to the task samples stored on disk.
//!
//! Layout of the data directory:
//!
//! ```text
//! asr/sample_{i}.wav        asr/sample_{i}.txt        (transcript)
//! cv/images/{i}.jpg         cv/annotations.json       (all detection annotations)
//! ocr/sample_{i}.jpg        ocr/sample_{i}_text.txt   (text)
//! ```

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::instrument;

use crate::protocol::{ServerMessage, TaskMessage, TaskPayload};
use crate::task_queue::{Task, TaskType};

/// Resolves and encodes task samples.
#[derive(Debug, Clone)]
pub struct AssetStore {
    data_dir: PathBuf,
    embed: bool,
}

impl AssetStore {
    /// Store rooted at `data_dir`. With `embed`, payloads carry the sample in base64,
    /// otherwise its path relative to `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>, embed: bool) -> AssetStore {
        AssetStore {
            data_dir: data_dir.into(),
            embed,
        }
    }

    /// Path of the sample, relative to the data directory.
    pub fn relative_path(task: &Task) -> PathBuf {
        let file = match task.task_type {
            TaskType::Asr => format!("sample_{}.wav", task.index),
            TaskType::Cv => format!("images/{}.jpg", task.index),
            TaskType::Ocr => format!("sample_{}.jpg", task.index),
        };
        Path::new(task.task_type.as_str()).join(file)
    }

    /// Ground truth of the sample, for scorers. Every `cv` sample shares
    /// `cv/annotations.json`, keyed by sample index.
    pub fn ground_truth_path(&self, task: &Task) -> PathBuf {
        let file = match task.task_type {
            TaskType::Asr => format!("sample_{}.txt", task.index),
            TaskType::Cv => "annotations.json".to_string(),
            TaskType::Ocr => format!("sample_{}_text.txt", task.index),
        };
        self.data_dir.join(task.task_type.as_str()).join(file)
    }

    /// Payload of `task`, embedded or as a path depending on the store mode.
    #[instrument(skip(self))]
    pub fn payload(&self, task: &Task) -> anyhow::Result<TaskPayload> {
        let relative = Self::relative_path(task);
        if self.embed {
            let path = self.data_dir.join(&relative);
            let data =
                fs::read(&path).with_context(|| format!("could not read {}", path.display()))?;
            Ok(TaskPayload::B64(STANDARD.encode(data)))
        } else {
            Ok(TaskPayload::Path(
                relative.to_string_lossy().replace('\\', "/"),
            ))
        }
    }

    /// Message handing `task` to the Scout.
    pub fn message(&self, task: &Task) -> anyhow::Result<ServerMessage> {
        let payload = self.payload(task)?;
        Ok(ServerMessage::Task(TaskMessage::side_task(
            task.task_type,
            payload,
        )))
    }

    /// Reads any file below the data directory and returns it in base64.
    ///
    /// Used to serve payloads sent as paths. Absolute paths and `..` are refused.
    pub fn read_b64(&self, relative: &str) -> anyhow::Result<String> {
        let relative = Path::new(relative);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("'{}' is not a path inside the data directory", relative.display());
        }
        let path = self.data_dir.join(relative);
        let data = fs::read(&path).with_context(|| format!("could not read {}", path.display()))?;
        Ok(STANDARD.encode(data))
    }
}
