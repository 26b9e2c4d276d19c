//! Writer end of the per-session input FIFO.
//!
//! Opening a FIFO for writing blocks in the kernel until a reader is
//! attached — that attachment is the supervisor's wake signal. Rather than
//! parking a thread on a blocking `open(2)`, the writer polls with
//! `O_WRONLY | O_NONBLOCK` (which fails `ENXIO` while no reader exists) until
//! the deadline, then clears the nonblocking flag for normal backpressure
//! semantics on writes.
//!
//! At most one writer exists per session; the engine owns it.

use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

/// Poll cadence while waiting for the supervisor's reader.
const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// The engine-held write end of a session FIFO.
#[derive(Debug)]
pub struct PipeWriter {
    file: tokio::fs::File,
}

impl PipeWriter {
    /// Open the FIFO for writing, waiting up to `timeout` for the
    /// supervisor's reader to attach.
    ///
    /// `ENXIO` (no reader yet) and `ENOENT` (supervisor has not created the
    /// FIFO yet) are retried until the deadline; exceeding it surfaces as
    /// `TimedOut`, which callers treat as "wrapper not running".
    pub async fn open(path: &Path, timeout: Duration) -> std::io::Result<Self> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
            {
                Ok(file) => {
                    clear_nonblock(&file)?;
                    return Ok(Self {
                        file: tokio::fs::File::from_std(file),
                    });
                }
                Err(e)
                    if e.raw_os_error() == Some(libc::ENXIO)
                        || e.kind() == std::io::ErrorKind::NotFound =>
                {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            format!("no reader on {} within {timeout:?}", path.display()),
                        ));
                    }
                    tokio::time::sleep(OPEN_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write one NDJSON line. A broken pipe (reader went away because the
    /// inner subprocess exited) surfaces as an error the engine recovers from
    /// with reconnect + single retry.
    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        eprintln!("DBG write_line: writing {} bytes", line.len());
        self.file.write_all(line.as_bytes()).await?;
        eprintln!("DBG write_line: write_all done");
        if !line.ends_with('\n') {
            self.file.write_all(b"\n").await?;
        }
        eprintln!("DBG write_line: before flush");
        let r = self.file.flush().await;
        eprintln!("DBG write_line: flush done {:?}", r.is_ok());
        r
    }
}

/// Drop `O_NONBLOCK` after the poll-open succeeded.
fn clear_nonblock(file: &std::fs::File) -> std::io::Result<()> {
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::stat::Mode;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn make_fifo(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("input.fifo");
        nix::unistd::mkfifo(&path, Mode::from_bits_truncate(0o644)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_open_times_out_without_reader() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = make_fifo(&dir);

        let err = PipeWriter::open(&path, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_open_succeeds_once_reader_attaches() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = make_fifo(&dir);

        let reader_path = path.clone();
        let reader = tokio::spawn(async move {
            let file = tokio::fs::File::open(&reader_path).await.unwrap();
            let mut lines = BufReader::new(file).lines();
            lines.next_line().await.unwrap()
        });

        let mut writer = PipeWriter::open(&path, Duration::from_secs(5)).await.unwrap();
        writer.write_line(r#"{"type":"user"}"#).await.unwrap();
        drop(writer);

        let line = reader.await.unwrap().unwrap();
        assert_eq!(line, r#"{"type":"user"}"#);
    }

    #[tokio::test]
    async fn test_write_after_reader_gone_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = make_fifo(&dir);

        let reader_path = path.clone();
        let reader = tokio::spawn(async move {
            let file = tokio::fs::File::open(&reader_path).await.unwrap();
            drop(file);
        });

        let mut writer = PipeWriter::open(&path, Duration::from_secs(5)).await.unwrap();
        reader.await.unwrap();
        // Give the kernel a moment to tear down the read end.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut saw_error = false;
        for _ in 0..8 {
            if writer.write_line("x").await.is_err() {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error, "expected EPIPE once the reader is gone");
    }
}
