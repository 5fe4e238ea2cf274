use crate::error::{Result, VigilError};
use crate::supervisor::InstanceId;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Which child stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Out,
    Err,
}

impl LogStream {
    fn tag(&self) -> &'static str {
        match self {
            LogStream::Out => "out",
            LogStream::Err => "err",
        }
    }
}

/// Shared log sink for all instances.
///
/// Three append-only files: stdout, stderr, and a combined merge of both.
/// Every write is one full timestamped line under the file's lock, so
/// concurrent instances interleave at line granularity without
/// truncation.
pub struct LogSink {
    out_path: PathBuf,
    err_path: PathBuf,
    combined_path: PathBuf,
    out: Mutex<File>,
    err: Mutex<File>,
    combined: Mutex<File>,
}

impl LogSink {
    /// Open (creating as needed) the three shared log files.
    pub async fn open(out_path: &Path, err_path: &Path, combined_path: &Path) -> Result<Arc<Self>> {
        let out = open_append(out_path).await?;
        let err = open_append(err_path).await?;
        let combined = open_append(combined_path).await?;

        Ok(Arc::new(Self {
            out_path: out_path.to_path_buf(),
            err_path: err_path.to_path_buf(),
            combined_path: combined_path.to_path_buf(),
            out: Mutex::new(out),
            err: Mutex::new(err),
            combined: Mutex::new(combined),
        }))
    }

    /// Append one line from an instance to its stream file and to the
    /// combined file.
    pub async fn write_line(
        &self,
        stream: LogStream,
        instance_id: InstanceId,
        line: &str,
    ) -> Result<()> {
        let entry = format_entry(stream, instance_id, line);

        {
            let mut file = match stream {
                LogStream::Out => self.out.lock().await,
                LogStream::Err => self.err.lock().await,
            };
            write_entry(&mut file, &entry).await?;
        }

        let mut combined = self.combined.lock().await;
        write_entry(&mut combined, &entry).await?;

        Ok(())
    }

    pub fn out_path(&self) -> &Path {
        &self.out_path
    }

    pub fn err_path(&self) -> &Path {
        &self.err_path
    }

    pub fn combined_path(&self) -> &Path {
        &self.combined_path
    }
}

async fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                VigilError::LogError(format!("Failed to create log directory: {}", e))
            })?;
        }
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| VigilError::LogFileError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

async fn write_entry(file: &mut File, entry: &str) -> Result<()> {
    file.write_all(entry.as_bytes())
        .await
        .map_err(|e| VigilError::LogError(format!("Failed to write to log: {}", e)))?;
    file.flush()
        .await
        .map_err(|e| VigilError::LogError(format!("Failed to flush log: {}", e)))?;
    Ok(())
}

/// Format a log entry: `[timestamp] [id|stream] line\n`
fn format_entry(stream: LogStream, instance_id: InstanceId, line: &str) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S %z");
    format!("[{}] [{}|{}] {}\n", timestamp, instance_id, stream.tag(), line)
}

/// Pump one child output stream into the sink line by line.
///
/// Runs until the stream reaches EOF (the child exited). Write failures
/// are logged and stop the pump; they never take down the child.
pub fn pump_stream<R>(
    sink: Arc<LogSink>,
    stream: LogStream,
    instance_id: InstanceId,
    reader: R,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Err(e) = sink.write_line(stream, instance_id, &line).await {
                        tracing::error!(
                            "Log write failed for instance {} ({}): {}",
                            instance_id,
                            stream.tag(),
                            e
                        );
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(
                        "Log stream closed for instance {} ({}): {}",
                        instance_id,
                        stream.tag(),
                        e
                    );
                    break;
                }
            }
        }
    })
}
