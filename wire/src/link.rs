// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Maximum length of one protocol line, including the trailing newline.
pub const LINE_MAX: usize = 4096;

const STREAM_CHUNK: usize = 65536;

#[derive(Debug)]
pub enum LinkError {
    /// The caller-supplied absolute deadline expired.
    Timeout,
    /// The peer closed the stream.
    Closed,
    /// An incoming line exceeded `LINE_MAX`.
    LineTooLong,
    /// The peer sent something the protocol does not allow.
    Protocol(String),
    Io(io::Error),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Timeout => write!(f, "deadline expired"),
            LinkError::Closed => write!(f, "connection closed by peer"),
            LinkError::LineTooLong => write!(f, "line exceeded {LINE_MAX} bytes"),
            LinkError::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            LinkError::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<io::Error> for LinkError {
    fn from(e: io::Error) -> Self {
        LinkError::Io(e)
    }
}

type BoxedStream = Box<dyn Stream>;

/// The combined bound we need for any byte stream a Link can wrap: plain TCP, a TLS-wrapped
/// stream, or an in-memory duplex in tests.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Connect a TCP stream bounded by an absolute deadline. The stream is returned raw so that the
/// caller may interpose TLS before constructing a `Link` from it.
pub async fn tcp_connect(host: &str, port: u16, stop: Instant) -> Result<TcpStream, LinkError> {
    let stream = tokio::time::timeout_at(stop, TcpStream::connect((host, port)))
        .await
        .map_err(|_| LinkError::Timeout)??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

///
/// One duplex byte stream carrying a line-oriented protocol with embedded binary payloads.
///
/// Every operation takes an absolute stoptime; expiry is a hard failure for that call and the
/// caller is expected to drop the link.
///
pub struct Link {
    reader: BufReader<ReadHalf<BoxedStream>>,
    writer: WriteHalf<BoxedStream>,
    /// Bytes of a line in progress, kept across calls so that a `read_line` future cancelled
    /// by `select!` mid-line loses nothing.
    partial: Vec<u8>,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl Link {
    pub fn from_tcp(stream: TcpStream) -> Link {
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        let mut link = Self::from_stream(stream);
        link.peer = peer;
        link.local = local;
        link
    }

    /// Wrap an arbitrary stream: a TLS-upgraded connection, or an in-memory duplex in tests.
    pub fn from_stream<S: Stream + 'static>(stream: S) -> Link {
        let (read, write) = tokio::io::split(Box::new(stream) as BoxedStream);
        Link {
            reader: BufReader::new(read),
            writer: write,
            partial: Vec::new(),
            peer: None,
            local: None,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    ///
    /// Read through the next newline, strip it (and any preceding carriage return), and return
    /// the line. Returns `Closed` on EOF at a line boundary, and `LineTooLong` if no newline
    /// appears within `LINE_MAX` bytes.
    ///
    /// Cancellation-safe: bytes of a partial line survive a cancelled call and are completed
    /// by the next one, so `read_line` can sit in a `select!` arm.
    ///
    pub async fn read_line(&mut self, stop: Instant) -> Result<String, LinkError> {
        let result = tokio::time::timeout_at(stop, async {
            loop {
                let buf = self.reader.fill_buf().await?;
                if buf.is_empty() {
                    return if self.partial.is_empty() {
                        Err(LinkError::Closed)
                    } else {
                        Err(LinkError::Protocol("eof mid-line".to_owned()))
                    };
                }
                if let Some(newline) = buf.iter().position(|b| *b == b'\n') {
                    self.partial.extend_from_slice(&buf[..newline]);
                    self.reader.consume(newline + 1);
                    let mut line = std::mem::take(&mut self.partial);
                    if line.len() >= LINE_MAX {
                        return Err(LinkError::LineTooLong);
                    }
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return String::from_utf8(line)
                        .map_err(|_| LinkError::Protocol("non-utf8 line".to_owned()));
                }
                self.partial.extend_from_slice(buf);
                let n = buf.len();
                self.reader.consume(n);
                if self.partial.len() >= LINE_MAX {
                    return Err(LinkError::LineTooLong);
                }
            }
        })
        .await;
        result.map_err(|_| LinkError::Timeout)?
    }

    /// Write one line, appending the newline. The `&mut self` receiver is what prevents
    /// interleaving with concurrent writes on the same link.
    pub async fn write_line(&mut self, line: &str, stop: Instant) -> Result<(), LinkError> {
        debug_assert!(!line.contains('\n'));
        tokio::time::timeout_at(stop, async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
            self.writer.flush().await?;
            Ok(())
        })
        .await
        .map_err(|_| LinkError::Timeout)?
    }

    pub async fn read_exact(&mut self, buf: &mut [u8], stop: Instant) -> Result<(), LinkError> {
        tokio::time::timeout_at(stop, async {
            self.reader.read_exact(buf).await.map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    LinkError::Closed
                } else {
                    LinkError::Io(e)
                }
            })?;
            Ok(())
        })
        .await
        .map_err(|_| LinkError::Timeout)?
    }

    pub async fn write_all(&mut self, buf: &[u8], stop: Instant) -> Result<(), LinkError> {
        tokio::time::timeout_at(stop, async {
            self.writer.write_all(buf).await?;
            self.writer.flush().await?;
            Ok(())
        })
        .await
        .map_err(|_| LinkError::Timeout)?
    }

    /// Copy exactly `length` bytes from the link into the given file.
    pub async fn stream_to_file(
        &mut self,
        file: &mut tokio::fs::File,
        length: u64,
        stop: Instant,
    ) -> Result<(), LinkError> {
        tokio::time::timeout_at(stop, async {
            let mut remaining = length;
            let mut chunk = vec![0_u8; STREAM_CHUNK];
            while remaining > 0 {
                let want = std::cmp::min(remaining, chunk.len() as u64) as usize;
                let got = self.reader.read(&mut chunk[..want]).await?;
                if got == 0 {
                    return Err(LinkError::Closed);
                }
                file.write_all(&chunk[..got]).await?;
                remaining -= got as u64;
            }
            Ok(())
        })
        .await
        .map_err(|_| LinkError::Timeout)?
    }

    /// Copy exactly `length` bytes from the given file onto the link.
    pub async fn stream_from_file(
        &mut self,
        file: &mut tokio::fs::File,
        length: u64,
        stop: Instant,
    ) -> Result<(), LinkError> {
        tokio::time::timeout_at(stop, async {
            let mut remaining = length;
            let mut chunk = vec![0_u8; STREAM_CHUNK];
            while remaining > 0 {
                let want = std::cmp::min(remaining, chunk.len() as u64) as usize;
                let got = file.read(&mut chunk[..want]).await?;
                if got == 0 {
                    return Err(LinkError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file shorter than declared length",
                    )));
                }
                self.writer.write_all(&chunk[..got]).await?;
                remaining -= got as u64;
            }
            self.writer.flush().await?;
            Ok(())
        })
        .await
        .map_err(|_| LinkError::Timeout)?
    }
}
