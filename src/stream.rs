//! The physical stream of a hub connection, split into its two halves.
//!
//! A [`StreamPair`] owns exactly one [`PduReader`]. Whoever holds the reader is
//! the only party reading from the stream, so handing the stream from the control
//! engine to a borrowed connection and back means moving that value.
//! Writes go through a cloneable [`PduWriter`] which serializes whole PDUs.

use crate::error::{Error, Result};
use crate::pdu::{HubPdu, PduCodec};
use bytes::{Buf, BytesMut};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::codec::Decoder;

pub type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

const READ_CHUNK: usize = 4096;

pub struct StreamPair {
    pub reader: PduReader,
    pub writer: PduWriter,
}

impl StreamPair {
    pub fn new<R, W>(r: R, w: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: PduReader::new(Box::new(r)),
            writer: PduWriter::new(Box::new(w)),
        }
    }

    pub fn from_tcp(stream: TcpStream) -> Self {
        let (r, w) = stream.into_split();
        Self::new(r, w)
    }

    /// Split any duplex transport, e.g. a Tor circuit or an in-memory pipe.
    pub fn split<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Self::new(r, w)
    }
}

/// Read half with its PDU buffer.
///
/// Both read methods are cancel safe: dropping a pending read never loses bytes,
/// they remain buffered for the next call.
pub struct PduReader {
    inner: BoxRead,
    buf: BytesMut,
    codec: PduCodec,
}

impl PduReader {
    pub fn new(inner: BoxRead) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            codec: PduCodec::default(),
        }
    }

    /// Wait for one complete PDU.
    pub async fn read_pdu(&mut self) -> Result<HubPdu> {
        loop {
            if let Some(pdu) = self.codec.decode(&mut self.buf)? {
                log::trace!("read pdu {:?}", pdu);
                return Ok(pdu);
            }

            self.buf.reserve(READ_CHUNK);
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return match self.codec.decode_eof(&mut self.buf)? {
                    Some(pdu) => Ok(pdu),
                    None => Err(Error::TransportLost(io::ErrorKind::UnexpectedEof.into())),
                };
            }
        }
    }

    /// Read raw bytes, draining whatever the PDU decoder left buffered first.
    pub async fn read_raw(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if !self.buf.is_empty() {
            // whatever the decoder expected no longer starts at the buffer head
            self.codec = PduCodec::default();
            let n = dst.len().min(self.buf.len());
            self.buf.copy_to_slice(&mut dst[..n]);
            return Ok(n);
        }
        self.inner.read(dst).await
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Shared write half. A PDU is written while holding the lock, so two PDUs are
/// never interleaved and nothing gets written between a PDU and a state change
/// made under the same guard.
#[derive(Clone)]
pub struct PduWriter {
    inner: Arc<Mutex<BoxWrite>>,
}

impl PduWriter {
    pub fn new(inner: BoxWrite) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub async fn lock(&self) -> WriteGuard<'_> {
        WriteGuard {
            inner: self.inner.lock().await,
        }
    }

    pub async fn write_pdu(&self, pdu: &HubPdu) -> Result<()> {
        self.lock().await.write_pdu(pdu).await
    }

    pub async fn write_raw(&self, data: &[u8]) -> io::Result<()> {
        self.lock().await.write_raw(data).await
    }

    /// Write a prefix of `data` and return its length. Cancel safe, nothing is
    /// written when the future is dropped before it completes.
    pub async fn write_some(&self, data: &[u8]) -> io::Result<usize> {
        self.inner.lock().await.write(data).await
    }

    pub async fn flush(&self) -> io::Result<()> {
        self.inner.lock().await.flush().await
    }
}

pub struct WriteGuard<'a> {
    inner: MutexGuard<'a, BoxWrite>,
}

impl WriteGuard<'_> {
    pub async fn write_pdu(&mut self, pdu: &HubPdu) -> Result<()> {
        let buf = pdu.write_to_bytes()?;
        log::trace!("write pdu {:?}", pdu);
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await
    }

    /// Close the write direction of the physical stream for good.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
