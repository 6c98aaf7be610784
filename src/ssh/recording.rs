//! Live JSONL recording of SSH stays.
//!
//! One writer per stay. Session-channel payload is recorded byte-for-byte
//! in both directions; exec, SFTP, and forward channels record metadata
//! events only. Every event is flushed as soon as it is written so the
//! web console can tail the file read-only.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Direction of a recorded payload event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client toward backend.
    ClientToServer,
    /// Backend toward client.
    ServerToClient,
}

impl Direction {
    const fn kind(self) -> &'static str {
        match self {
            Self::ClientToServer => "c→s",
            Self::ServerToClient => "s→c",
        }
    }
}

/// One recorded event line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingEvent {
    /// Unix milliseconds.
    pub t: i64,
    /// `open`, `c→s`, `s→c`, `close`, or `note`.
    pub kind: String,
    /// SSH channel number the event belongs to.
    pub channel: u32,
    /// Base64 payload for data events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Context for open/close/note events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

struct Inner {
    file: File,
    bytes: u64,
}

/// The single writer for one stay's recording file.
pub struct Recorder {
    inner: Mutex<Inner>,
    path: PathBuf,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// Create the recording file, including parent directories.
    ///
    /// # Errors
    ///
    /// Propagates file-system errors.
    pub fn create(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            inner: Mutex::new(Inner { file, bytes: 0 }),
            path,
        })
    }

    /// Record a channel opening.
    pub fn open(&self, channel: u32, what: &str) {
        self.write(RecordingEvent {
            t: Utc::now().timestamp_millis(),
            kind: "open".to_owned(),
            channel,
            data: None,
            reason: Some(what.to_owned()),
        });
    }

    /// Record payload bytes flowing through a session channel.
    pub fn data(&self, channel: u32, direction: Direction, payload: &[u8]) {
        self.write(RecordingEvent {
            t: Utc::now().timestamp_millis(),
            kind: direction.kind().to_owned(),
            channel,
            data: Some(BASE64.encode(payload)),
            reason: None,
        });
    }

    /// Record a channel closing.
    pub fn close(&self, channel: u32, reason: &str) {
        self.write(RecordingEvent {
            t: Utc::now().timestamp_millis(),
            kind: "close".to_owned(),
            channel,
            data: None,
            reason: Some(reason.to_owned()),
        });
    }

    /// Record a metadata note (byte counters on non-payload channels,
    /// gateway broadcasts).
    pub fn note(&self, channel: u32, note: &str) {
        self.write(RecordingEvent {
            t: Utc::now().timestamp_millis(),
            kind: "note".to_owned(),
            channel,
            data: None,
            reason: Some(note.to_owned()),
        });
    }

    /// Bytes written to the file so far.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .bytes
    }

    /// The recording file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, event: RecordingEvent) {
        let Ok(line) = serde_json::to_string(&event) else {
            return;
        };
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if writeln!(inner.file, "{line}").is_ok() {
            inner.bytes += line.len() as u64 + 1;
            // Flush per event so live tailing sees every byte.
            let _ = inner.file.flush();
        }
    }
}

/// Read a recording back, for replay tooling and tests.
///
/// # Errors
///
/// Propagates IO and parse errors.
pub fn read_events(path: &Path) -> anyhow::Result<Vec<RecordingEvent>> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for line in reader.lines() {
        events.push(serde_json::from_str(&line?)?);
    }
    Ok(events)
}

/// Concatenate the decoded payload of one direction on one channel, in
/// recorded order.
///
/// # Errors
///
/// Propagates base64 decode errors.
pub fn replay_direction(
    events: &[RecordingEvent],
    channel: u32,
    direction: Direction,
) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for event in events {
        if event.channel == channel && event.kind == direction.kind() {
            if let Some(data) = &event.data {
                bytes.extend(BASE64.decode(data)?);
            }
        }
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn events_flush_per_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stay.jsonl");
        let recorder = Recorder::create(path.clone()).unwrap();

        recorder.open(0, "shell");
        recorder.data(0, Direction::ServerToClient, b"$ ");
        recorder.close(0, "client_closed");

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, "open");
        assert_eq!(events[1].kind, "s→c");
        assert_eq!(events[2].kind, "close");
        assert_eq!(recorder.bytes(), std::fs::metadata(&path).unwrap().len());
    }

    proptest! {
        // Bytes recorded server-to-client must reassemble exactly from
        // the JSONL file, chunked arbitrarily.
        #[test]
        fn replay_round_trips(chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..64),
            0..16,
        )) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("stay.jsonl");
            let recorder = Recorder::create(path.clone()).unwrap();

            let mut expected = Vec::new();
            for chunk in &chunks {
                recorder.data(0, Direction::ServerToClient, chunk);
                expected.extend_from_slice(chunk);
            }
            // Interleaved other-direction traffic must not leak in.
            recorder.data(0, Direction::ClientToServer, b"typed input");

            let events = read_events(&path).unwrap();
            let replayed = replay_direction(&events, 0, Direction::ServerToClient).unwrap();
            prop_assert_eq!(replayed, expected);
        }
    }
}
