//! Persistence of match results and rendered rounds.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use time::{format_description::parse, OffsetDateTime};
use tracing::{info, instrument};

use crate::environment::Frame;
use crate::results::MatchResults;

/// Where the controller stores what a match produces.
pub trait ArtifactSink: Send {
    /// Stores the frames rendered during round `round`.
    fn save_round(&mut self, round: usize, frames: &[Frame]) -> anyhow::Result<()>;

    /// Stores the current match results, replacing any previous version.
    fn save_results(&mut self, results: &MatchResults) -> anyhow::Result<()>;
}

/// Writes artifacts below `<artifacts_dir>/match_<start time>/`:
///
/// - `match_results.json`
/// - `round_<n>.frames`: every frame of the round, each prefixed by its length as a
///   little-endian `u32`
#[derive(Debug)]
pub struct FileArtifactSink {
    match_dir: PathBuf,
}

impl FileArtifactSink {
    /// Creates the directory of a match started at `started`.
    pub fn create(artifacts_dir: &Path, started: OffsetDateTime) -> anyhow::Result<Self> {
        let format = parse("match_[year]-[month]-[day]_[hour]-[minute]-[second]")?;
        let match_dir = artifacts_dir.join(started.format(&format)?);
        fs::create_dir_all(&match_dir)
            .with_context(|| format!("could not create {}", match_dir.display()))?;
        info!(match_dir = %match_dir.display(), "artifact directory ready");
        Ok(FileArtifactSink { match_dir })
    }

    /// Directory of this match.
    pub fn match_dir(&self) -> &Path {
        &self.match_dir
    }
}

impl ArtifactSink for FileArtifactSink {
    #[instrument(skip(self, frames), fields(frames = frames.len()))]
    fn save_round(&mut self, round: usize, frames: &[Frame]) -> anyhow::Result<()> {
        let path = self.match_dir.join(format!("round_{round}.frames"));
        let file =
            File::create(&path).with_context(|| format!("could not create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        for frame in frames {
            let len = u32::try_from(frame.len()).context("frame larger than 4GiB")?;
            writer.write_all(&len.to_le_bytes())?;
            writer.write_all(frame)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn save_results(&mut self, results: &MatchResults) -> anyhow::Result<()> {
        let path = self.match_dir.join("match_results.json");
        let file =
            File::create(&path).with_context(|| format!("could not create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, results)
            .with_context(|| format!("could not write {}", path.display()))?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_results_and_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileArtifactSink::create(dir.path(), OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(
            sink.match_dir(),
            dir.path().join("match_1970-01-01_00-00-00")
        );

        sink.save_round(0, &[vec![1, 2, 3], vec![]]).unwrap();
        let bytes = fs::read(sink.match_dir().join("round_0.frames")).unwrap();
        assert_eq!(bytes, [3, 0, 0, 0, 1, 2, 3, 0, 0, 0, 0]);

        let results = MatchResults::new(vec!["a".into()], 2, "novice".into());
        sink.save_results(&results).unwrap();
        let written = fs::read_to_string(sink.match_dir().join("match_results.json")).unwrap();
        assert_eq!(
            serde_json::from_str::<MatchResults>(&written).unwrap(),
            results
        );
    }
}
