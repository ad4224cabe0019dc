//! Packet capture writer using the classic pcap file format: a 24-byte
//! global header followed by one 16-byte record header plus payload per
//! captured frame. Capture is optional and best-effort: write failures
//! are logged and otherwise ignored, never propagated to the caller.

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const PCAP_LINKTYPE_ETHERNET: u32 = 1;

/// Writes the 24-byte classic pcap global header.
fn global_header(snaplen: u32) -> [u8; 24] {
    let mut buf = [0u8; 24];
    buf[0..4].copy_from_slice(&PCAP_MAGIC.to_ne_bytes());
    buf[4..6].copy_from_slice(&PCAP_VERSION_MAJOR.to_ne_bytes());
    buf[6..8].copy_from_slice(&PCAP_VERSION_MINOR.to_ne_bytes());
    // thiszone = 0, sigfigs = 0
    buf[8..12].copy_from_slice(&0i32.to_ne_bytes());
    buf[12..16].copy_from_slice(&0u32.to_ne_bytes());
    buf[16..20].copy_from_slice(&snaplen.to_ne_bytes());
    buf[20..24].copy_from_slice(&PCAP_LINKTYPE_ETHERNET.to_ne_bytes());
    buf
}

/// Writes one 16-byte per-record header `{tv_sec, tv_usec, caplen, len}`.
fn record_header(len: u32) -> [u8; 16] {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut buf = [0u8; 16];
    buf[0..4].copy_from_slice(&(now.as_secs() as u32).to_ne_bytes());
    buf[4..8].copy_from_slice(&(now.subsec_micros()).to_ne_bytes());
    buf[8..12].copy_from_slice(&len.to_ne_bytes());
    buf[12..16].copy_from_slice(&len.to_ne_bytes());
    buf
}

/// A best-effort packet capture writer. Any write failure is logged at
/// `debug` and the writer disables itself rather than erroring out the
/// caller.
pub struct PcapWriter {
    file: Option<tokio::fs::File>,
}

impl PcapWriter {
    /// Disabled capture (no `--pcap` path given).
    pub fn disabled() -> Self {
        Self { file: None }
    }

    /// Opens `path` for writing and emits the global header. On failure,
    /// capture is disabled for the rest of the run rather than aborting
    /// startup.
    pub async fn open(path: &std::path::Path, snaplen: u32) -> Self {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
        {
            Ok(mut file) => {
                if let Err(e) = file.write_all(&global_header(snaplen)).await {
                    tracing::warn!(error = %e, "cannot write pcap header");
                    return Self::disabled();
                }
                tracing::info!(path = %path.display(), "saving packet capture");
                Self { file: Some(file) }
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "cannot open pcap file");
                Self::disabled()
            }
        }
    }

    /// Appends one captured frame. No-op if capture is disabled.
    pub async fn write_frame(&mut self, frame: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let header = record_header(frame.len() as u32);
        if let Err(e) = file.write_all(&header).await {
            tracing::debug!(error = %e, len = frame.len(), "cannot log packet");
            return;
        }
        if let Err(e) = file.write_all(frame).await {
            tracing::debug!(error = %e, len = frame.len(), "cannot log packet");
        }
    }
}

/// Synchronous variant of [`global_header`]/[`record_header`] assembly,
/// exposed for tests that don't need a real file.
pub fn encode_record(frame: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + frame.len());
    buf.write_all(&record_header(frame.len() as u32)).ok();
    buf.extend_from_slice(frame);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_header_has_the_expected_magic_and_size() {
        let hdr = global_header(65535);
        assert_eq!(hdr.len(), 24);
        assert_eq!(u32::from_ne_bytes(hdr[0..4].try_into().unwrap()), PCAP_MAGIC);
        assert_eq!(u32::from_ne_bytes(hdr[20..24].try_into().unwrap()), PCAP_LINKTYPE_ETHERNET);
    }

    #[test]
    fn record_header_caplen_matches_len_for_uncapped_frames() {
        let record = encode_record(b"hello");
        assert_eq!(record.len(), 16 + 5);
        let caplen = u32::from_ne_bytes(record[8..12].try_into().unwrap());
        let len = u32::from_ne_bytes(record[12..16].try_into().unwrap());
        assert_eq!(caplen, 5);
        assert_eq!(len, 5);
    }

    #[tokio::test]
    async fn disabled_writer_never_touches_a_file() {
        let mut writer = PcapWriter::disabled();
        writer.write_frame(b"ignored").await; // must not panic
    }

    #[tokio::test]
    async fn open_writes_header_then_frames_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcap");
        let mut writer = PcapWriter::open(&path, 1500).await;
        writer.write_frame(b"frame-one").await;
        writer.write_frame(b"second").await;

        let contents = tokio::fs::read(&path).await.unwrap();
        assert!(contents.len() > 24);
        assert_eq!(
            u32::from_ne_bytes(contents[0..4].try_into().unwrap()),
            PCAP_MAGIC
        );
    }
}
