use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ::time::{macros::format_description, OffsetDateTime};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::config::NmapConfig;
use crate::error::ScanError;
use crate::options::ScanOptions;
use crate::types::ScanResult;

const ELEVATION_COMMAND: &str = "sudo";

static OUTPUT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Runs the external scanner and parses its XML report.
#[derive(Debug, Clone)]
pub struct ScanExecutor {
    binary_path: String,
    use_sudo: bool,
    work_dir: PathBuf,
    timeout: Option<Duration>,
}

impl ScanExecutor {
    pub fn new(cfg: &NmapConfig) -> Self {
        if let Err(e) = create_work_dir(&cfg.temp_dir) {
            warn!(dir = %cfg.temp_dir.display(), error = %e, "failed to create scanner work dir");
        }
        Self {
            binary_path: cfg.binary_path.clone(),
            use_sudo: cfg.use_sudo,
            work_dir: cfg.temp_dir.clone(),
            timeout: cfg.timeout,
        }
    }

    /// Run one scan to completion.
    ///
    /// - Launch failures, non-zero exits and timeouts skip parsing entirely.
    /// - The XML output file is removed on every path out of this function.
    pub async fn run(&self, jid: &str, options: &ScanOptions) -> Result<ScanResult, ScanError> {
        let output = OutputFile::new(self.output_path(jid));
        let argv = self.build_args(options, output.path());
        info!(jid, command = %argv.join(" "), "starting scanner");

        let start = Instant::now();
        self.execute(jid, &argv).await?;
        info!(jid, elapsed = ?start.elapsed(), "scanner finished");

        let result = parse_output(output.path()).await?;
        info!(jid, hosts = result.hosts.len(), "parsed scan output");
        for host in &result.hosts {
            let addr = host.addresses.first().map(|a| a.addr.as_str()).unwrap_or("?");
            debug!(
                jid,
                addr,
                state = host.status.as_ref().map(|s| s.state.as_str()).unwrap_or(""),
                hostnames = ?host.hostnames().collect::<Vec<_>>(),
                ports = host.ports().len(),
                "host"
            );
        }
        Ok(result)
    }

    /// Full argv: optional elevation command, scanner binary, `-oX <path>`, then
    /// the caller's tokens in order.
    pub fn build_args(&self, options: &ScanOptions, xml_path: &Path) -> Vec<String> {
        let mut args = Vec::with_capacity(options.tokens().len() + 4);
        if self.use_sudo {
            args.push(ELEVATION_COMMAND.to_string());
        }
        args.push(self.binary_path.clone());
        args.push("-oX".to_string());
        args.push(xml_path.display().to_string());
        args.extend(options.tokens().iter().cloned());
        args
    }

    /// A fresh report path inside the work dir for this invocation.
    pub fn output_path(&self, jid: &str) -> PathBuf {
        let now = OffsetDateTime::now_utc();
        let stamp = now
            .format(format_description!(
                "[year].[month].[day]-[hour].[minute].[second].[subsecond digits:6]"
            ))
            .unwrap_or_else(|_| now.unix_timestamp().to_string());
        let seq = OUTPUT_SEQ.fetch_add(1, Ordering::Relaxed);
        let file = format!("{}_{}_{}_nmap.xml", sanitize(jid), stamp, seq);
        self.work_dir.join(file)
    }

    async fn execute(&self, jid: &str, argv: &[String]) -> Result<(), ScanError> {
        let (program, rest) = argv.split_first().ok_or_else(|| ScanError::Launch {
            program: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;

        let mut child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ScanError::Launch {
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().map(BufReader::new);
        let stderr = child.stderr.take().map(BufReader::new);

        let wait = async {
            let (_, _, status) = tokio::join!(
                relay_lines(jid, "stdout", stdout),
                relay_lines(jid, "stderr", stderr),
                child.wait()
            );
            status
        };

        let finished = match self.timeout {
            Some(limit) => time::timeout(limit, wait).await.ok(),
            None => Some(wait.await),
        };
        let Some(status) = finished else {
            let limit = self.timeout.unwrap_or_default();
            warn!(jid, ?limit, "scanner timed out, killing it");
            let _ = child.kill().await;
            return Err(ScanError::Timeout(limit));
        };

        let status = status.map_err(|source| ScanError::Launch {
            program: program.clone(),
            source,
        })?;
        check_exit(status)
    }
}

fn check_exit(status: ExitStatus) -> Result<(), ScanError> {
    if status.success() {
        Ok(())
    } else {
        Err(ScanError::Exit { status })
    }
}

/// Forward each line of a child stream into the log.
///
/// Output is raw bytes (banners, hostnames); invalid UTF-8 is replaced, never
/// fatal. The pipe stays drained until EOF so the child cannot block or die on
/// a closed pipe.
async fn relay_lines<R>(jid: &str, stream: &'static str, reader: Option<R>)
where
    R: AsyncBufRead + Unpin,
{
    let Some(mut reader) = reader else { return };
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if line.trim().is_empty() {
                    continue;
                }
                if stream == "stderr" {
                    warn!(jid, stream, "{line}");
                } else {
                    info!(jid, stream, "{line}");
                }
            }
            Err(e) => {
                debug!(jid, stream, error = %e, "scanner output unreadable, discarding the rest");
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                break;
            }
        }
    }
}

/// Parse an nmap XML document.
pub fn parse_report(xml: &str) -> Result<ScanResult, quick_xml::DeError> {
    quick_xml::de::from_str(xml)
}

async fn parse_output(path: &Path) -> Result<ScanResult, ScanError> {
    let xml = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ScanError::ReadOutput {
            path: path.to_path_buf(),
            source,
        })?;
    parse_report(&xml).map_err(|source| ScanError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Removes the report file when dropped.
struct OutputFile {
    path: PathBuf,
}

impl OutputFile {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OutputFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove scan output"),
        }
    }
}

fn sanitize(jid: &str) -> String {
    jid.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(unix)]
fn create_work_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o750)
        .create(dir)
}

#[cfg(not(unix))]
fn create_work_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}
