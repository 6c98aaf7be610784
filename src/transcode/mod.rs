//! The replay transcode queue.
//!
//! Closed RDP stays can be turned into browser-playable MP4s by an
//! external transcoder binary. The queue is store-backed (FIFO with a
//! priority override) and drained by a bounded pool of worker tasks,
//! each running at most one job: at most `W` jobs are `running` and at
//! most `P` are `pending` at any time. Workers stream the transcoder's
//! `frame K of N` progress into the job row and enforce per-job CPU and
//! memory ceilings.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng as _;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::core::errors::GatewayError;
use crate::core::stay::Protocol;
use crate::store::{SqliteStore, TranscodeJob};

/// Per-job resource ceilings; breaching either kills the job.
#[derive(Debug, Clone, Copy)]
pub struct JobLimits {
    /// Total CPU seconds the transcoder may burn.
    pub cpu_seconds: u64,
    /// Resident set ceiling in bytes.
    pub max_rss_bytes: u64,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            cpu_seconds: 1800,
            max_rss_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

/// Worker poll floor, to bound database load.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The queue plus its worker pool configuration.
pub struct TranscodeQueue {
    store: Arc<SqliteStore>,
    config: Arc<Config>,
    limits: JobLimits,
}

impl std::fmt::Debug for TranscodeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeQueue")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl TranscodeQueue {
    /// Create the queue.
    #[must_use]
    pub fn new(store: Arc<SqliteStore>, config: Arc<Config>, limits: JobLimits) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            limits,
        })
    }

    /// Enqueue a transcode for a closed RDP stay.
    ///
    /// # Errors
    ///
    /// [`GatewayError::NotFound`] for an unknown stay,
    /// [`GatewayError::Conflict`] for a non-RDP or still-open stay,
    /// [`GatewayError::ResourceExhausted`] when the pending cap is hit.
    pub async fn enqueue(&self, stay_id: Uuid) -> Result<TranscodeJob, GatewayError> {
        let Some(stay) = self.store.stays().by_id(stay_id).await? else {
            return Err(GatewayError::NotFound {
                what: format!("stay {stay_id}"),
            });
        };
        if stay.protocol != Protocol::Rdp {
            return Err(GatewayError::Conflict {
                what: format!("stay {stay_id} is not an RDP stay"),
            });
        }
        if stay.is_active() {
            return Err(GatewayError::Conflict {
                what: format!("stay {stay_id} is still active"),
            });
        }

        self.store
            .transcode()
            .enqueue(stay_id, self.config.transcode_queue_max)
            .await
    }

    /// Jump a pending job ahead of the queue.
    ///
    /// # Errors
    ///
    /// [`GatewayError::NotFound`] if the job is not pending.
    pub async fn rush(&self, job_id: i64) -> Result<TranscodeJob, GatewayError> {
        self.store.transcode().rush(job_id).await
    }

    /// Run `W` worker tasks until cancelled.
    pub async fn run_workers(self: Arc<Self>, cancel: CancellationToken) {
        let mut workers = Vec::with_capacity(self.config.transcode_workers);
        for index in 0..self.config.transcode_workers {
            let queue = Arc::clone(&self);
            let cancel = cancel.clone();
            workers.push(tokio::spawn(queue.worker_loop(index, cancel)));
        }
        for worker in workers {
            let _ = worker.await;
        }
    }

    async fn worker_loop(self: Arc<Self>, index: usize, cancel: CancellationToken) {
        tracing::debug!(worker = index, "transcode worker started");
        loop {
            // Jitter keeps the workers from hammering the store in step.
            let jitter = Duration::from_millis(rand::rng().random_range(0..250));
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(MIN_POLL_INTERVAL + jitter) => {}
            }

            let job = match self.store.transcode().claim().await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(worker = index, error = %err, "claim failed");
                    continue;
                }
            };

            tracing::info!(worker = index, job_id = job.id, stay_id = %job.stay_id, "transcode started");
            if let Err(err) = self.execute(&job).await {
                tracing::warn!(job_id = job.id, error = %err, "transcode job errored");
                let _ = self.store.transcode().fail(job.id, &err.to_string()).await;
            }
        }
        tracing::debug!(worker = index, "transcode worker stopped");
    }

    /// Run one claimed job to completion.
    async fn execute(&self, job: &TranscodeJob) -> Result<(), GatewayError> {
        let input = self.replay_path_for(job).await?;
        let output = self.config.rdp_mp4_path(job.stay_id);
        let part = output.with_extension("mp4.part");

        let mut child = Command::new(&self.config.transcoder_bin)
            .arg(&input)
            .arg(&part)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::Other(anyhow::anyhow!("spawn transcoder: {e}")))?;

        let pid = child.id();
        let started = Instant::now();

        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
        let mut stdout_open = stdout.is_some();
        let mut stderr_open = stderr.is_some();
        let mut last_error_line = String::new();
        let mut resource_exceeded = false;
        let mut watchdog = tokio::time::interval(Duration::from_secs(1));

        let status = loop {
            tokio::select! {
                line = next_stdout(&mut stdout), if stdout_open => {
                    match line {
                        Some(line) => {
                            if let Some((done, total)) = parse_progress(&line) {
                                let eta = eta_seconds(started.elapsed(), done, total);
                                let _ = self
                                    .store
                                    .transcode()
                                    .heartbeat(job.id, done, total, eta)
                                    .await;
                            }
                        }
                        None => stdout_open = false,
                    }
                }
                line = next_stderr(&mut stderr), if stderr_open => {
                    match line {
                        Some(line) => {
                            if !line.trim().is_empty() {
                                last_error_line = line;
                            }
                        }
                        None => stderr_open = false,
                    }
                }
                _ = watchdog.tick() => {
                    if let Some(pid) = pid {
                        if breaches_limits(pid, self.limits) {
                            resource_exceeded = true;
                            let _ = child.start_kill();
                        }
                    }
                }
                status = child.wait() => {
                    break status.map_err(|e| GatewayError::Other(e.into()))?;
                }
            }
        };

        if resource_exceeded {
            let _ = tokio::fs::remove_file(&part).await;
            self.store.transcode().fail(job.id, "resource_exceeded").await?;
            return Ok(());
        }

        if status.success() {
            // Atomic publish: the MP4 appears complete or not at all.
            tokio::fs::rename(&part, &output)
                .await
                .map_err(|e| GatewayError::Other(anyhow::anyhow!("publish output: {e}")))?;
            self.store.transcode().complete(job.id, &output).await?;
            tracing::info!(job_id = job.id, output = %output.display(), "transcode done");
        } else {
            let _ = tokio::fs::remove_file(&part).await;
            let error = if last_error_line.is_empty() {
                format!("transcoder exited with {status}")
            } else {
                last_error_line
            };
            self.store.transcode().fail(job.id, &error).await?;
        }

        Ok(())
    }

    async fn replay_path_for(&self, job: &TranscodeJob) -> Result<PathBuf, GatewayError> {
        let stay = self.store.stays().by_id(job.stay_id).await?;
        let path = stay
            .and_then(|s| s.recording_path)
            .unwrap_or_else(|| self.config.rdp_replay_path(job.stay_id));
        if !path.exists() {
            return Err(GatewayError::NotFound {
                what: format!("replay {}", path.display()),
            });
        }
        Ok(path)
    }
}

type OutLines = tokio::io::Lines<BufReader<tokio::process::ChildStdout>>;
type ErrLines = tokio::io::Lines<BufReader<tokio::process::ChildStderr>>;

async fn next_stdout(lines: &mut Option<OutLines>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.unwrap_or(None),
        None => None,
    }
}

async fn next_stderr(lines: &mut Option<ErrLines>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.unwrap_or(None),
        None => None,
    }
}

/// Parse a `frame K of N` progress line.
fn parse_progress(line: &str) -> Option<(i64, i64)> {
    let mut words = line.split_whitespace();
    loop {
        if words.next()? == "frame" {
            break;
        }
    }
    let done: i64 = words.next()?.parse().ok()?;
    if words.next()? != "of" {
        return None;
    }
    let total: i64 = words.next()?.parse().ok()?;
    (done >= 0 && total > 0).then_some((done, total))
}

/// `elapsed * (N - K) / K`, `None` until the first frame lands.
fn eta_seconds(elapsed: Duration, done: i64, total: i64) -> Option<i64> {
    if done <= 0 || total <= done {
        return (total == done && done > 0).then_some(0);
    }
    let per_frame = elapsed.as_secs_f64() / done as f64;
    Some((per_frame * (total - done) as f64).round() as i64)
}

/// Check the transcoder's CPU time and RSS against the ceilings.
#[cfg(target_os = "linux")]
fn breaches_limits(pid: u32, limits: JobLimits) -> bool {
    let rss_exceeded = std::fs::read_to_string(format!("/proc/{pid}/statm"))
        .ok()
        .and_then(|statm| {
            let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
            Some(pages * 4096 > limits.max_rss_bytes)
        })
        .unwrap_or(false);

    let cpu_exceeded = std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            // Fields 14 and 15 (1-based) are utime and stime in ticks.
            let after_comm = stat.rsplit_once(')')?.1;
            let mut fields = after_comm.split_whitespace();
            let utime: u64 = fields.nth(11)?.parse().ok()?;
            let stime: u64 = fields.next()?.parse().ok()?;
            Some((utime + stime) / 100 > limits.cpu_seconds)
        })
        .unwrap_or(false);

    rss_exceeded || cpu_exceeded
}

#[cfg(not(target_os = "linux"))]
fn breaches_limits(_pid: u32, _limits: JobLimits) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines_parse() {
        assert_eq!(parse_progress("frame 10 of 200"), Some((10, 200)));
        assert_eq!(parse_progress("[info] frame 3 of 9 (33%)"), Some((3, 9)));
        assert_eq!(parse_progress("framing complete"), None);
        assert_eq!(parse_progress("frame x of 9"), None);
        assert_eq!(parse_progress("frame 1 of 0"), None);
    }

    #[test]
    fn eta_is_linear_in_remaining_frames() {
        let eta = eta_seconds(Duration::from_secs(10), 10, 30).unwrap();
        assert_eq!(eta, 20);
        assert_eq!(eta_seconds(Duration::from_secs(5), 0, 30), None);
        assert_eq!(eta_seconds(Duration::from_secs(5), 30, 30), Some(0));
    }
}
