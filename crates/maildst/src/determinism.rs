//! Twin-run determinism verification.
//!
//! A run's artifacts are the files under the environment's artifact
//! directory. After the first run they are copied to
//! `<snapshot_root>/seed{seed}_steps{steps}`, the second run overwrites the
//! live directory, and the two sets are compared by per-file blake3 hash.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::runner::{RunReport, Simulation, SimulationError};

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("failed reading artifacts at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed writing snapshot at {path:?}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Content hashes of every regular file below a root, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactSet {
    files: BTreeMap<PathBuf, blake3::Hash>,
}

impl ArtifactSet {
    /// Hashes everything below `root`. A missing root is an empty set.
    pub fn capture(root: &Path) -> Result<Self, ArtifactError> {
        let mut set = Self::default();
        match fs::metadata(root) {
            Ok(meta) if meta.is_dir() => set.visit(root, Path::new(""))?,
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ArtifactError::Read {
                    path: root.to_path_buf(),
                    source,
                })
            }
        }
        Ok(set)
    }

    fn visit(&mut self, root: &Path, relative: &Path) -> Result<(), ArtifactError> {
        let dir = root.join(relative);
        let read_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ArtifactError::Read { path, source }
        };
        for entry in fs::read_dir(&dir).map_err(read_err(&dir))? {
            let entry = entry.map_err(read_err(&dir))?;
            let file_type = entry.file_type().map_err(read_err(&entry.path()))?;
            let child = relative.join(entry.file_name());
            if file_type.is_dir() {
                self.visit(root, &child)?;
            } else if file_type.is_file() {
                let path = entry.path();
                let content = fs::read(&path).map_err(read_err(&path))?;
                self.files.insert(child, blake3::hash(&content));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn diff(&self, other: &Self) -> ArtifactDiff {
        let mut diff = ArtifactDiff::default();
        for (path, hash) in &self.files {
            match other.files.get(path) {
                None => diff.only_in_first.push(path.clone()),
                Some(theirs) if theirs != hash => diff.changed.push(path.clone()),
                Some(_) => {}
            }
        }
        diff.only_in_second = other
            .files
            .keys()
            .filter(|path| !self.files.contains_key(*path))
            .cloned()
            .collect();
        diff
    }
}

/// Relative paths that differ between two artifact sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArtifactDiff {
    pub only_in_first: Vec<PathBuf>,
    pub only_in_second: Vec<PathBuf>,
    pub changed: Vec<PathBuf>,
}

impl ArtifactDiff {
    pub fn is_empty(&self) -> bool {
        self.only_in_first.is_empty() && self.only_in_second.is_empty() && self.changed.is_empty()
    }
}

/// First position at which two selection traces diverge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceMismatch {
    pub index: usize,
    pub first: Option<String>,
    pub second: Option<String>,
}

impl TraceMismatch {
    pub fn between(first: &[String], second: &[String]) -> Option<Self> {
        let len = first.len().max(second.len());
        (0..len)
            .find(|&i| first.get(i) != second.get(i))
            .map(|index| Self {
                index,
                first: first.get(index).cloned(),
                second: second.get(index).cloned(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeterminismOutcome {
    /// Both runs passed with identical traces and artifacts.
    Identical,
    /// Run `run` (1 or 2) failed; nothing was compared.
    RunFailed { run: u8 },
    Violation {
        artifacts: ArtifactDiff,
        trace: Option<TraceMismatch>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct DeterminismReport {
    pub first: RunReport,
    pub second: Option<RunReport>,
    pub snapshot: PathBuf,
    pub outcome: DeterminismOutcome,
}

impl DeterminismReport {
    pub fn passed(&self) -> bool {
        self.outcome == DeterminismOutcome::Identical
    }

    pub fn is_violation(&self) -> bool {
        matches!(self.outcome, DeterminismOutcome::Violation { .. })
    }
}

/// Directory the first run's artifacts are copied to.
pub fn snapshot_dir(snapshot_root: &Path, seed: u64, steps: u64) -> PathBuf {
    snapshot_root.join(format!("seed{seed}_steps{steps}"))
}

/// Replaces `dest` with a recursive copy of `src`. A missing `src` leaves an
/// empty `dest`.
pub fn copy_snapshot(src: &Path, dest: &Path) -> Result<(), ArtifactError> {
    let write_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ArtifactError::Snapshot { path, source }
    };
    match fs::remove_dir_all(dest) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(write_err(dest)(err)),
    }
    fs::create_dir_all(dest).map_err(write_err(dest))?;
    if !src.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(src).map_err(|source| ArtifactError::Read {
        path: src.to_path_buf(),
        source,
    })? {
        let entry = entry.map_err(|source| ArtifactError::Read {
            path: src.to_path_buf(),
            source,
        })?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            copy_snapshot(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(write_err(&to))?;
        }
    }
    Ok(())
}

impl Simulation {
    /// Runs `seed` twice and compares selection traces and artifacts.
    ///
    /// A failing run short-circuits with [`DeterminismOutcome::RunFailed`];
    /// a difference between two passing runs is a
    /// [`DeterminismOutcome::Violation`].
    pub fn run_with_determinism_check(
        &self,
        seed: u64,
        steps: u64,
    ) -> Result<DeterminismReport, SimulationError> {
        let artifact_dir = self.environment().artifact_dir();
        let snapshot = snapshot_dir(&self.environment().snapshot_root(), seed, steps);

        tracing::info!(seed, steps, "Determinism check: first run");
        let first = self.run(seed, steps)?;
        if !first.passed() {
            return Ok(DeterminismReport {
                first,
                second: None,
                snapshot,
                outcome: DeterminismOutcome::RunFailed { run: 1 },
            });
        }
        copy_snapshot(&artifact_dir, &snapshot)?;
        let first_artifacts = ArtifactSet::capture(&snapshot)?;
        tracing::info!(
            files = first_artifacts.len(),
            snapshot = ?snapshot,
            "Captured first run artifacts"
        );

        tracing::info!(seed, steps, "Determinism check: second run");
        let second = self.run(seed, steps)?;
        if !second.passed() {
            return Ok(DeterminismReport {
                first,
                second: Some(second),
                snapshot,
                outcome: DeterminismOutcome::RunFailed { run: 2 },
            });
        }
        let second_artifacts = ArtifactSet::capture(&artifact_dir)?;

        let artifacts = first_artifacts.diff(&second_artifacts);
        let trace = TraceMismatch::between(&first.trace, &second.trace);
        let outcome = if artifacts.is_empty() && trace.is_none() {
            tracing::info!(seed, files = second_artifacts.len(), "Runs are identical");
            DeterminismOutcome::Identical
        } else {
            tracing::error!(
                seed,
                only_in_first = ?artifacts.only_in_first,
                only_in_second = ?artifacts.only_in_second,
                changed = ?artifacts.changed,
                trace = ?trace,
                "Determinism violation"
            );
            DeterminismOutcome::Violation { artifacts, trace }
        };
        Ok(DeterminismReport {
            first,
            second: Some(second),
            snapshot,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testresult::TestResult;

    fn write(root: &Path, relative: &str, content: &str) -> io::Result<()> {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap())?;
        fs::write(path, content)
    }

    #[test]
    fn missing_root_is_empty() -> TestResult {
        let dir = tempfile::tempdir()?;
        assert!(ArtifactSet::capture(&dir.path().join("absent"))?.is_empty());
        Ok(())
    }

    #[test]
    fn snapshot_round_trips_the_tree() -> TestResult {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("mail");
        write(&src, "a@example.com/Hello.eml", "hello")?;
        write(&src, "b@example.com/Re_ Hi.eml", "hi")?;
        let dest = snapshot_dir(&dir.path().join("snapshots"), 42, 5);
        // stale content is replaced
        write(&dest, "stale.eml", "old")?;

        copy_snapshot(&src, &dest)?;
        let original = ArtifactSet::capture(&src)?;
        let copy = ArtifactSet::capture(&dest)?;
        assert_eq!(original.len(), 2);
        assert!(original.diff(&copy).is_empty());
        assert!(dest.ends_with("seed42_steps5"));
        Ok(())
    }

    #[test]
    fn diff_reports_every_difference() -> TestResult {
        let dir = tempfile::tempdir()?;
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        write(&first, "x/same.eml", "same")?;
        write(&second, "x/same.eml", "same")?;
        write(&first, "x/changed.eml", "abc")?;
        write(&second, "x/changed.eml", "abd")?;
        write(&first, "gone.eml", "1")?;
        write(&second, "new.eml", "2")?;

        let diff = ArtifactSet::capture(&first)?.diff(&ArtifactSet::capture(&second)?);
        assert_eq!(diff.changed, vec![PathBuf::from("x/changed.eml")]);
        assert_eq!(diff.only_in_first, vec![PathBuf::from("gone.eml")]);
        assert_eq!(diff.only_in_second, vec![PathBuf::from("new.eml")]);
        Ok(())
    }

    #[test]
    fn trace_mismatch_finds_first_divergence() {
        let a: Vec<String> = ["x", "y", "z"].map(String::from).to_vec();
        let b: Vec<String> = ["x", "y", "w"].map(String::from).to_vec();
        assert_eq!(TraceMismatch::between(&a, &a), None);
        let mismatch = TraceMismatch::between(&a, &b).unwrap();
        assert_eq!(mismatch.index, 2);
        assert_eq!(mismatch.second.as_deref(), Some("w"));
        let short = TraceMismatch::between(&a, &a[..1]).unwrap();
        assert_eq!(short.index, 1);
        assert_eq!(short.second, None);
    }
}
