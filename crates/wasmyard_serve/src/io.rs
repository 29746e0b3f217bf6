//! Per-instance stdio plumbing.
//!
//! A FIFO set is created in the instance's volatile directory at create
//! time; the runtime attaches to the write ends, and at start a forwarder
//! copies stdout/stderr into the instance's log file, one line per record:
//!
//! `<rfc3339 timestamp> <stream> F <content>`

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;

use crate::error::{YardError, YardResult};

pub struct InstanceIo {
    id: String,
    fifo_dir: PathBuf,
    stdin: Option<PathBuf>,
    stdout: PathBuf,
    stderr: PathBuf,
    terminal: bool,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    closed: Mutex<bool>,
}

impl InstanceIo {
    /// Creates the FIFO set under `volatile_dir`. `stdin` is only created
    /// when the workload asked for an open stdin.
    pub fn new(id: &str, volatile_dir: &Path, tty: bool, with_stdin: bool) -> YardResult<Self> {
        let fifo_dir = volatile_dir.join("io");
        std::fs::create_dir_all(&fifo_dir)?;

        let stdout = fifo_dir.join("stdout");
        let stderr = fifo_dir.join("stderr");
        let stdin = with_stdin.then(|| fifo_dir.join("stdin"));

        let mut fifos = vec![&stdout, &stderr];
        if let Some(stdin) = &stdin {
            fifos.push(stdin);
        }
        for path in fifos {
            let _ = std::fs::remove_file(path);
            nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o600)).map_err(
                |e| {
                    YardError::internal(format!(
                        "failed to create FIFO {} for {id:?}: {e}",
                        path.display()
                    ))
                },
            )?;
        }

        Ok(Self {
            id: id.to_string(),
            fifo_dir,
            stdin,
            stdout,
            stderr,
            terminal: tty,
            forwarders: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        })
    }

    pub fn stdin_path(&self) -> String {
        self.stdin
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn stdout_path(&self) -> String {
        self.stdout.to_string_lossy().into_owned()
    }

    pub fn stderr_path(&self) -> String {
        self.stderr.to_string_lossy().into_owned()
    }

    pub fn terminal(&self) -> bool {
        self.terminal
    }

    /// Spawns forwarders copying stdout/stderr FIFO output into `log_path`.
    pub fn start_log_forwarder(&self, log_path: &Path) -> YardResult<()> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log_file = std::sync::Arc::new(tokio::sync::Mutex::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .map(tokio::fs::File::from_std)?,
        ));

        let mut forwarders = self.forwarders.lock().unwrap();
        for (stream, path) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            // Read-write keeps the FIFO open across writer reconnects, so the
            // forwarder never sees EOF before the runtime attaches.
            let receiver = pipe::OpenOptions::new()
                .read_write(true)
                .open_receiver(path)
                .map_err(|e| {
                    YardError::internal(format!(
                        "failed to open {stream} FIFO for {:?}: {e}",
                        self.id
                    ))
                })?;
            forwarders.push(tokio::spawn(forward_stream(
                stream,
                receiver,
                std::sync::Arc::clone(&log_file),
            )));
        }
        Ok(())
    }

    /// Stops forwarders and removes the FIFO set. Idempotent.
    pub fn close(&self) {
        let mut closed = self.closed.lock().unwrap();
        if *closed {
            return;
        }
        *closed = true;

        for handle in self.forwarders.lock().unwrap().drain(..) {
            handle.abort();
        }

        let mut fifos = vec![self.stdout.clone(), self.stderr.clone()];
        if let Some(stdin) = &self.stdin {
            fifos.push(stdin.clone());
        }
        for path in fifos {
            let _ = std::fs::remove_file(path);
        }
        // Only removed when empty; the directory is shared with nothing else.
        let _ = std::fs::remove_dir(&self.fifo_dir);
    }
}

impl Drop for InstanceIo {
    fn drop(&mut self) {
        self.close();
    }
}

async fn forward_stream(
    stream: &'static str,
    receiver: pipe::Receiver,
    log_file: std::sync::Arc<tokio::sync::Mutex<tokio::fs::File>>,
) {
    let mut lines = tokio::io::BufReader::new(receiver).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let record = format!(
                    "{} {stream} F {line}\n",
                    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
                );
                let mut file = log_file.lock().await;
                if let Err(e) = file.write_all(record.as_bytes()).await {
                    tracing::warn!("Failed to append {stream} log record: {e}");
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Failed to read {stream} FIFO: {e}");
                return;
            }
        }
    }
}
