//! Bidirectional channel splicing.
//!
//! Session channels are spliced message-by-message so payload can be
//! recorded and gateway lines injected; forward channels are spliced as
//! raw streams with byte counting only. Every splice observes the stay's
//! termination channel: on a signal the backend half closes immediately,
//! the recorder gets its final events, and the client half follows.

use std::sync::Arc;
use std::time::Duration;

use russh::{ChannelMsg, client, server};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::core::registry::{StayEvent, StayHandle};
use crate::core::stay::TerminationReason;
use crate::ssh::recording::{Direction, Recorder};

/// Requests that arrive at the handler after the channel was handed to
/// its splice task.
#[derive(Debug, Clone, Copy)]
pub enum ChannelControl {
    /// Client terminal resized.
    WindowChange {
        /// Columns.
        col_width: u32,
        /// Rows.
        row_height: u32,
        /// Pixel width.
        pix_width: u32,
        /// Pixel height.
        pix_height: u32,
    },
}

/// A session-channel splice between the client and the backend.
pub struct SessionSplice {
    /// Server-side channel to the client.
    pub client: russh::Channel<server::Msg>,
    /// Client-side channel to the backend.
    pub backend: russh::Channel<client::Msg>,
    /// The owning stay.
    pub stay: StayHandle,
    /// Recording index of this channel.
    pub channel_no: u32,
    /// The stay's recorder.
    pub recorder: Arc<Recorder>,
    /// Whether payload bytes are recorded (session channels) or only
    /// metadata (exec, sftp).
    pub record_payload: bool,
    /// Whether gateway lines (preamble, warnings) are written into the
    /// server-to-client stream.
    pub interactive: bool,
    /// Shell preamble, written before any backend output.
    pub preamble: Option<String>,
    /// Idle cutoff; `None` disables it.
    pub idle_timeout: Option<Duration>,
    /// Control requests relayed from the handler.
    pub control: mpsc::Receiver<ChannelControl>,
}

impl SessionSplice {
    /// Run until either side closes, the stay terminates, or the idle
    /// cutoff fires. Returns why the channel ended.
    #[allow(clippy::too_many_lines, reason = "one select loop, linear to read")]
    pub async fn run(mut self) -> TerminationReason {
        let mut events = self.stay.subscribe();
        let mut attached = false;

        if let Some(preamble) = self.preamble.take() {
            if self.client.data(preamble.as_bytes()).await.is_err() {
                return TerminationReason::ClientClosed;
            }
        }

        let idle_max = self.idle_timeout.unwrap_or(Duration::from_secs(86400 * 365));
        let idle = tokio::time::sleep(idle_max);
        tokio::pin!(idle);

        let reason = loop {
            tokio::select! {
                msg = self.client.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            self.stay.add_bytes(data.len() as i64, 0);
                            if self.record_payload {
                                self.record(&mut attached, Direction::ClientToServer, &data).await;
                            }
                            if self.backend.data(&data[..]).await.is_err() {
                                break TerminationReason::ServerClosed;
                            }
                            idle.as_mut().reset(tokio::time::Instant::now() + idle_max);
                        }
                        Some(ChannelMsg::Eof) => {
                            let _ = self.backend.eof().await;
                        }
                        Some(ChannelMsg::Close) | None => {
                            break TerminationReason::ClientClosed;
                        }
                        Some(_) => {}
                    }
                }
                msg = self.backend.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            self.stay.add_bytes(0, data.len() as i64);
                            if self.record_payload {
                                self.record(&mut attached, Direction::ServerToClient, &data).await;
                            }
                            if self.client.data(&data[..]).await.is_err() {
                                break TerminationReason::ClientClosed;
                            }
                            idle.as_mut().reset(tokio::time::Instant::now() + idle_max);
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            self.stay.add_bytes(0, data.len() as i64);
                            if self.client.extended_data(ext, &data[..]).await.is_err() {
                                break TerminationReason::ClientClosed;
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            self.recorder
                                .note(self.channel_no, &format!("exit_status {exit_status}"));
                        }
                        Some(ChannelMsg::Eof) => {
                            let _ = self.client.eof().await;
                        }
                        Some(ChannelMsg::Close) | None => {
                            break TerminationReason::ServerClosed;
                        }
                        Some(_) => {}
                    }
                }
                control = self.control.recv() => {
                    if let Some(ChannelControl::WindowChange {
                        col_width,
                        row_height,
                        pix_width,
                        pix_height,
                    }) = control
                    {
                        let _ = self
                            .backend
                            .window_change(col_width, row_height, pix_width, pix_height)
                            .await;
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(StayEvent::Warning { minutes }) => {
                            if self.interactive {
                                let line = warning_line(minutes);
                                let _ = self.client.data(line.as_bytes()).await;
                            }
                            self.recorder
                                .note(self.channel_no, &format!("expiry warning {minutes}m"));
                        }
                        Ok(StayEvent::Terminate { reason }) => {
                            // Backend half first, client half within 500 ms.
                            let _ = self.backend.close().await;
                            if self.interactive {
                                let line = termination_line(reason);
                                let _ = self.client.data(line.as_bytes()).await;
                            }
                            break reason;
                        }
                        Err(_) => {}
                    }
                }
                () = &mut idle => {
                    self.recorder.note(self.channel_no, "idle timeout");
                    break TerminationReason::ClientClosed;
                }
            }
        };

        let _ = self.backend.close().await;
        let _ = self.client.eof().await;
        let _ = self.client.close().await;
        self.recorder.close(self.channel_no, &reason.to_string());
        reason
    }

    async fn record(&self, attached: &mut bool, direction: Direction, payload: &[u8]) {
        self.recorder.data(self.channel_no, direction, payload);
        if !*attached {
            *attached = true;
            if let Err(err) = self
                .stay
                .attach_recording(self.recorder.path().to_path_buf())
                .await
            {
                tracing::debug!(error = %err, "recording attach failed");
            }
        }
    }
}

/// The highlighted `[gateway]` warning line.
#[must_use]
pub fn warning_line(minutes: i64) -> String {
    let noun = if minutes == 1 { "minute" } else { "minutes" };
    format!("\r\n\u{1b}[1;33m[gateway] session expires in {minutes} {noun}\u{1b}[0m\r\n")
}

/// The final `[gateway]` line written before close.
#[must_use]
pub fn termination_line(reason: TerminationReason) -> String {
    let text = match reason {
        TerminationReason::PolicyExpired => "policy expired",
        TerminationReason::Revoked => "revoked",
        TerminationReason::ServerClosed => "server closed",
        TerminationReason::ClientClosed | TerminationReason::Error => "closed",
    };
    format!("\r\n\u{1b}[1;31m[gateway] session terminated: {text}\u{1b}[0m\r\n")
}

/// Splice two raw streams (forward channels), counting bytes into the
/// stay. No payload recording and no idle cutoff; the stay's termination
/// channel still cuts both halves.
pub async fn splice_counted<A, B>(
    client: A,
    backend: B,
    stay: &StayHandle,
) -> std::io::Result<TerminationReason>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut events = stay.subscribe();
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut backend_r, mut backend_w) = tokio::io::split(backend);

    let mut cbuf = vec![0u8; 16 * 1024];
    let mut bbuf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            read = client_r.read(&mut cbuf) => {
                match read? {
                    0 => {
                        let _ = backend_w.shutdown().await;
                        return Ok(TerminationReason::ClientClosed);
                    }
                    n => {
                        backend_w.write_all(&cbuf[..n]).await?;
                        stay.add_bytes(n as i64, 0);
                    }
                }
            }
            read = backend_r.read(&mut bbuf) => {
                match read? {
                    0 => {
                        let _ = client_w.shutdown().await;
                        return Ok(TerminationReason::ServerClosed);
                    }
                    n => {
                        client_w.write_all(&bbuf[..n]).await?;
                        stay.add_bytes(0, n as i64);
                    }
                }
            }
            event = events.recv() => {
                if let Ok(StayEvent::Terminate { reason }) = event {
                    let _ = backend_w.shutdown().await;
                    let _ = client_w.shutdown().await;
                    return Ok(reason);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_lines_carry_the_prefix_and_minutes() {
        assert!(warning_line(5).contains("[gateway] session expires in 5 minutes"));
        assert!(warning_line(1).contains("in 1 minute"));
    }

    #[test]
    fn termination_line_spells_out_expiry() {
        assert!(
            termination_line(TerminationReason::PolicyExpired)
                .contains("[gateway] session terminated: policy expired")
        );
        assert!(
            termination_line(TerminationReason::Revoked)
                .contains("[gateway] session terminated: revoked")
        );
    }

    #[tokio::test]
    async fn splice_counted_moves_bytes_both_ways() {
        let (client_gw, mut client_far) = tokio::io::duplex(4096);
        let (backend_gw, mut backend_far) = tokio::io::duplex(4096);

        // A stay handle needs the full registry; exercise the pure stream
        // mechanics with a detached pair instead.
        let (registry, _store, _dir) = crate::core::registry::tests_support::fixture().await;
        let handle = crate::core::registry::tests_support::open_ssh_stay(&registry).await;

        let splice = tokio::spawn({
            let handle = handle.clone();
            async move { splice_counted(client_gw, backend_gw, &handle).await }
        });

        client_far.write_all(b"input from operator").await.unwrap();
        let mut buf = [0u8; 64];
        let n = backend_far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"input from operator");

        backend_far.write_all(b"output").await.unwrap();
        let n = client_far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"output");

        drop(client_far);
        let reason = splice.await.unwrap().unwrap();
        assert_eq!(reason, TerminationReason::ClientClosed);
    }
}
