//! Tap transport framing.
//!
//! `PasstFraming` speaks the byte-stream wire format: each Ethernet frame
//! is prefixed with a 4-byte big-endian length. `PastaFraming` speaks raw
//! Ethernet frames over a `/dev/net/tun` character device opened in
//! `IFF_TAP | IFF_NO_PI` mode. Both are driven through the same
//! `TapSink`/`TapSource` traits so the TCP splice and UDP engines never
//! need to know which mode is active.

use crate::error::{Error, Result};
use bytes::Bytes;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::io::FromRawFd;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

/// Largest single record this implementation will forward in one batched
/// write; a sent datagram larger than `SHRT_MAX` risks confusing the
/// length-prefixed framing reassembler on the peer side.
pub const MAX_BATCH_BYTES: usize = i16::MAX as usize;

/// Something frames can be read from, one Ethernet frame at a time.
#[async_trait::async_trait(?Send)]
pub trait TapSource {
    async fn recv_frame(&mut self) -> Result<Bytes>;
}

/// Something frames can be written to, either one at a time (PASTA) or as
/// a coalesced batch (PASST).
#[async_trait::async_trait(?Send)]
pub trait TapSink {
    /// Writes a single frame immediately.
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Writes several frames as one coalesced scatter-gather send,
    /// recovering a truncated final record synchronously so the
    /// reassembler on the other end never observes a partial record.
    async fn send_batch(&mut self, frames: &[Bytes]) -> Result<()>;
}

/// Byte-stream framing used in PASST mode: a `UnixStream` or `TcpStream`
/// carrying a sequence of 4-byte-big-endian-length-prefixed records.
pub enum PasstTransport {
    Unix(UnixStream),
    Tcp(TcpStream),
}

pub struct PasstFraming {
    transport: PasstTransport,
}

impl PasstFraming {
    pub fn new(transport: PasstTransport) -> Self {
        Self { transport }
    }

    async fn read_exact_into(&mut self, buf: &mut [u8]) -> Result<()> {
        match &mut self.transport {
            PasstTransport::Unix(s) => s.read_exact(buf).await?,
            PasstTransport::Tcp(s) => s.read_exact(buf).await?,
        };
        Ok(())
    }

    /// Writes one length-prefixed record as a single vectored write,
    /// falling back to a synchronous completion write for whatever
    /// `write_vectored` left unsent (short writes are legal even for a
    /// single `writev`).
    async fn write_record(&mut self, len_prefix: [u8; 4], frame: &[u8]) -> Result<()> {
        let bufs = [
            std::io::IoSlice::new(&len_prefix),
            std::io::IoSlice::new(frame),
        ];
        let total = len_prefix.len() + frame.len();
        let mut written = match &mut self.transport {
            PasstTransport::Unix(s) => s.write_vectored(&bufs).await?,
            PasstTransport::Tcp(s) => s.write_vectored(&bufs).await?,
        };
        if written >= total {
            return Ok(());
        }
        // Partial write: finish the record synchronously, never leaving a
        // truncated record on the wire.
        let mut combined = Vec::with_capacity(total);
        combined.extend_from_slice(&len_prefix);
        combined.extend_from_slice(frame);
        while written < total {
            let n = match &mut self.transport {
                PasstTransport::Unix(s) => s.write(&combined[written..]).await?,
                PasstTransport::Tcp(s) => s.write(&combined[written..]).await?,
            };
            if n == 0 {
                return Err(Error::Framing("peer closed mid-record".into()));
            }
            written += n;
        }
        Ok(())
    }
}

#[async_trait::async_trait(?Send)]
impl TapSource for PasstFraming {
    async fn recv_frame(&mut self) -> Result<Bytes> {
        let mut len_buf = [0u8; 4];
        self.read_exact_into(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut frame = vec![0u8; len];
        self.read_exact_into(&mut frame).await?;
        Ok(Bytes::from(frame))
    }
}

#[async_trait::async_trait(?Send)]
impl TapSink for PasstFraming {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let len_prefix = (frame.len() as u32).to_be_bytes();
        self.write_record(len_prefix, frame).await
    }

    async fn send_batch(&mut self, frames: &[Bytes]) -> Result<()> {
        // Coalesce into chunks that respect MAX_BATCH_BYTES (counting
        // each record's 4-byte length prefix), each chunk flushed as one
        // vectored write. A single frame over the cap still goes out
        // alone rather than being split mid-record.
        let mut chunk_start = 0;
        let mut chunk_bytes = 0usize;
        for (i, frame) in frames.iter().enumerate() {
            let record_bytes = 4 + frame.len();
            if chunk_bytes > 0 && chunk_bytes + record_bytes > MAX_BATCH_BYTES {
                self.write_batch_chunk(&frames[chunk_start..i]).await?;
                chunk_start = i;
                chunk_bytes = 0;
            }
            chunk_bytes += record_bytes;
        }
        if chunk_start < frames.len() {
            self.write_batch_chunk(&frames[chunk_start..]).await?;
        }
        Ok(())
    }
}

impl PasstFraming {
    /// Writes one or more records as a single vectored send, falling
    /// back to a synchronous completion write for whatever
    /// `write_vectored` left unsent.
    async fn write_batch_chunk(&mut self, chunk: &[Bytes]) -> Result<()> {
        let mut len_prefixes = Vec::with_capacity(chunk.len());
        let mut total = 0usize;
        for frame in chunk {
            len_prefixes.push((frame.len() as u32).to_be_bytes());
            total += 4 + frame.len();
        }
        let mut bufs = Vec::with_capacity(chunk.len() * 2);
        for (frame, len_prefix) in chunk.iter().zip(&len_prefixes) {
            bufs.push(std::io::IoSlice::new(len_prefix));
            bufs.push(std::io::IoSlice::new(frame));
        }
        let mut written = match &mut self.transport {
            PasstTransport::Unix(s) => s.write_vectored(&bufs).await?,
            PasstTransport::Tcp(s) => s.write_vectored(&bufs).await?,
        };
        if written >= total {
            return Ok(());
        }
        let mut combined = Vec::with_capacity(total);
        for (frame, len_prefix) in chunk.iter().zip(&len_prefixes) {
            combined.extend_from_slice(len_prefix);
            combined.extend_from_slice(frame);
        }
        while written < total {
            let n = match &mut self.transport {
                PasstTransport::Unix(s) => s.write(&combined[written..]).await?,
                PasstTransport::Tcp(s) => s.write(&combined[written..]).await?,
            };
            if n == 0 {
                return Err(Error::Framing("peer closed mid-batch".into()));
            }
            written += n;
        }
        Ok(())
    }
}

/// `TUNSETIFF` ioctl plumbing for PASTA mode, grounded on the Linux
/// `tuntap.txt` ABI: open `/dev/net/tun`, then `ioctl(TUNSETIFF)` with
/// `IFF_TAP | IFF_NO_PI` so frames carry no 4-byte packet-info header.
mod tun {
    use super::*;
    use std::ffi::CString;

    const IFF_TAP: libc::c_short = 0x0002;
    const IFF_NO_PI: libc::c_short = 0x1000;
    const TUNSETIFF: libc::c_ulong = 0x400454ca;
    const IFNAMSIZ: usize = 16;

    #[repr(C)]
    struct IfReq {
        ifr_name: [libc::c_char; IFNAMSIZ],
        ifr_flags: libc::c_short,
        _pad: [u8; 22],
    }

    pub fn open_tap(name: &str) -> Result<RawFd> {
        let path = CString::new("/dev/net/tun").unwrap();
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(Error::TunSetup(format!(
                "open /dev/net/tun: {}",
                std::io::Error::last_os_error()
            )));
        }

        let mut ifr: IfReq = unsafe { std::mem::zeroed() };
        let name_bytes = name.as_bytes();
        if name_bytes.len() >= IFNAMSIZ {
            unsafe { libc::close(fd) };
            return Err(Error::TunSetup(format!(
                "interface name {name:?} too long for IFNAMSIZ"
            )));
        }
        for (i, &b) in name_bytes.iter().enumerate() {
            ifr.ifr_name[i] = b as libc::c_char;
        }
        ifr.ifr_flags = IFF_TAP | IFF_NO_PI;

        let ret = unsafe { libc::ioctl(fd, TUNSETIFF, &mut ifr as *mut IfReq) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::TunSetup(format!("TUNSETIFF({name}): {err}")));
        }
        Ok(fd)
    }
}

/// Raw-frame framing used in PASTA mode over a `/dev/net/tun` character
/// device: no length prefix, each `read`/`write` is exactly one Ethernet
/// frame.
pub struct PastaFraming {
    device: File,
    mtu: usize,
}

impl PastaFraming {
    /// Opens and configures the tuntap device for interface `name`.
    pub fn open(name: &str, mtu: usize) -> Result<Self> {
        let fd = tun::open_tap(name)?;
        // SAFETY: `open_tap` just returned this fd to us and performed no
        // further operations on it; `File::from_raw_fd` takes ownership.
        let std_file = unsafe { std::fs::File::from_raw_fd(fd) };
        let device = File::from_std(std_file);
        Ok(Self { device, mtu })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.device.as_raw_fd()
    }
}

#[async_trait::async_trait(?Send)]
impl TapSource for PastaFraming {
    async fn recv_frame(&mut self) -> Result<Bytes> {
        let mut buf = vec![0u8; self.mtu];
        let n = self.device.read(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }
}

#[async_trait::async_trait(?Send)]
impl TapSink for PastaFraming {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.device.write_all(frame).await?;
        Ok(())
    }

    async fn send_batch(&mut self, frames: &[Bytes]) -> Result<()> {
        // PASTA's flush rule is "write each frame immediately" — no
        // coalescing, one write() per frame.
        for frame in frames {
            self.send_frame(frame).await?;
        }
        Ok(())
    }
}

/// Whichever transport is active for this run, behind one concrete type
/// so callers driving the UDP/TCP engines don't need a boxed trait
/// object to hold "the tap, whichever kind it is".
pub enum TapHandle {
    Passt(PasstFraming),
    Pasta(PastaFraming),
}

#[async_trait::async_trait(?Send)]
impl TapSource for TapHandle {
    async fn recv_frame(&mut self) -> Result<Bytes> {
        match self {
            TapHandle::Passt(t) => t.recv_frame().await,
            TapHandle::Pasta(t) => t.recv_frame().await,
        }
    }
}

#[async_trait::async_trait(?Send)]
impl TapSink for TapHandle {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        match self {
            TapHandle::Passt(t) => t.send_frame(frame).await,
            TapHandle::Pasta(t) => t.send_frame(frame).await,
        }
    }

    async fn send_batch(&mut self, frames: &[Bytes]) -> Result<()> {
        match self {
            TapHandle::Passt(t) => t.send_batch(frames).await,
            TapHandle::Pasta(t) => t.send_batch(frames).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passt_round_trips_a_length_prefixed_frame_over_a_unix_socket() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut writer = PasstFraming::new(PasstTransport::Unix(a));
        let mut reader = PasstFraming::new(PasstTransport::Unix(b));

        let frame = Bytes::from_static(b"\x00\x01\x02hello-ethernet-frame");
        writer.send_frame(&frame).await.unwrap();
        let got = reader.recv_frame().await.unwrap();
        assert_eq!(got, frame);
    }

    #[tokio::test]
    async fn passt_round_trips_several_frames_in_one_batch() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut writer = PasstFraming::new(PasstTransport::Unix(a));
        let mut reader = PasstFraming::new(PasstTransport::Unix(b));

        let frames = vec![
            Bytes::from_static(b"frame-one"),
            Bytes::from_static(b"frame-two-longer"),
            Bytes::from_static(b"3"),
        ];
        writer.send_batch(&frames).await.unwrap();
        for expected in &frames {
            let got = reader.recv_frame().await.unwrap();
            assert_eq!(&got, expected);
        }
    }

    #[tokio::test]
    async fn send_batch_splits_into_chunks_that_respect_the_byte_cap() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut writer = PasstFraming::new(PasstTransport::Unix(a));
        let mut reader = PasstFraming::new(PasstTransport::Unix(b));

        let big = Bytes::from(vec![0x42u8; MAX_BATCH_BYTES - 10]);
        let frames = vec![big.clone(), Bytes::from_static(b"small-tail-frame")];
        writer.send_batch(&frames).await.unwrap();

        let first = reader.recv_frame().await.unwrap();
        assert_eq!(first, big);
        let second = reader.recv_frame().await.unwrap();
        assert_eq!(second, Bytes::from_static(b"small-tail-frame"));
    }

    #[tokio::test]
    async fn send_batch_never_splits_a_single_frame_over_the_cap() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut writer = PasstFraming::new(PasstTransport::Unix(a));
        let mut reader = PasstFraming::new(PasstTransport::Unix(b));

        let oversized = Bytes::from(vec![0x7a; MAX_BATCH_BYTES + 100]);
        writer.send_batch(std::slice::from_ref(&oversized)).await.unwrap();
        let got = reader.recv_frame().await.unwrap();
        assert_eq!(got, oversized);
    }
}
