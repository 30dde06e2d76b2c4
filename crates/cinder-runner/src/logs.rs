//! Captured step output.
//!
//! Each attempt writes one file at
//! `<log_dir>/<run>/<job>/<step>.<attempt>.log`. Lines are masked before
//! they reach disk; stderr lines carry a `[stderr] ` prefix.

use crate::runner::{OutputLine, OutputStream};
use cinder_core::run::LogRef;
use cinder_core::secrets::SecretMasker;
use cinder_core::{JobId, Result, RunId, StepId};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

const STDERR_PREFIX: &str = "[stderr] ";

/// Replace characters that do not belong in a file name.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        _ => cleaned,
    }
}

#[derive(Debug, Clone)]
pub struct LogStore {
    root: PathBuf,
}

impl LogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, run_id: RunId, job: &JobId, step: &StepId, attempt: u32) -> PathBuf {
        self.root
            .join(run_id.to_string())
            .join(sanitize_file_name(job.as_str()))
            .join(format!("{}.{}.log", sanitize_file_name(step.as_str()), attempt))
    }

    pub async fn create(
        &self,
        run_id: RunId,
        job: &JobId,
        step: &StepId,
        attempt: u32,
        masker: SecretMasker,
    ) -> Result<LogWriter> {
        let path = self.path_for(run_id, job, step, attempt);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await?;
        Ok(LogWriter {
            path,
            writer: BufWriter::new(file),
            masker,
            lines: 0,
            bytes: 0,
        })
    }
}

/// Appends masked lines to a step log.
pub struct LogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    masker: SecretMasker,
    lines: u64,
    bytes: u64,
}

impl LogWriter {
    pub async fn write(&mut self, line: &OutputLine) -> Result<()> {
        self.write_line(line.stream, &line.content).await
    }

    pub async fn write_line(&mut self, stream: OutputStream, content: &str) -> Result<()> {
        let masked = self.masker.mask(content);
        let mut record = String::with_capacity(masked.len() + STDERR_PREFIX.len() + 1);
        if stream == OutputStream::Stderr {
            record.push_str(STDERR_PREFIX);
        }
        record.push_str(&masked);
        record.push('\n');

        self.writer.write_all(record.as_bytes()).await?;
        self.lines += 1;
        self.bytes += record.len() as u64;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the log.
    pub async fn finish(mut self) -> Result<LogRef> {
        self.writer.flush().await?;
        Ok(LogRef {
            path: self.path,
            lines: self.lines,
            bytes: self.bytes,
        })
    }
}

/// The last `count` lines of a log.
pub async fn tail(log: &LogRef, count: usize) -> Result<Vec<String>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let file = File::open(&log.path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut window = std::collections::VecDeque::with_capacity(count);
    while let Some(line) = lines.next_line().await? {
        if window.len() == count {
            window.pop_front();
        }
        window.push_back(line);
    }
    Ok(window.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("unit tests"), "unit_tests");
        assert_eq!(sanitize_file_name("../escape"), ".._escape");
        assert_eq!(sanitize_file_name(".."), "_");
    }

    #[tokio::test]
    async fn test_log_layout_and_masking() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path());
        let run = RunId::new();
        let masker = SecretMasker::new(["s3cr3t-token".to_string()]);

        let mut log = store
            .create(run, &JobId::new("deploy"), &StepId::new("sync"), 2, masker)
            .await
            .unwrap();
        log.write_line(OutputStream::Stdout, "uploading with s3cr3t-token")
            .await
            .unwrap();
        log.write_line(OutputStream::Stderr, "warning").await.unwrap();
        let log = log.finish().await.unwrap();

        assert_eq!(
            log.path,
            dir.path().join(run.to_string()).join("deploy").join("sync.2.log")
        );
        assert_eq!(log.lines, 2);
        let content = std::fs::read_to_string(&log.path).unwrap();
        assert_eq!(content, "uploading with ***\n[stderr] warning\n");
        assert_eq!(log.bytes, content.len() as u64);

        assert_eq!(tail(&log, 1).await.unwrap(), vec!["[stderr] warning"]);
    }
}
