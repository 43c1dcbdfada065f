use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::edgetun::tunnel::protocol::{MAX_DATAGRAM_BYTES, ProtocolError};

/// Reading half of datagram framing over a byte stream.
///
/// Each datagram is encoded as: `u32be len` + `payload`.
pub struct DatagramReader<R> {
    inner: R,
}

impl<R> DatagramReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R> DatagramReader<R>
where
    R: AsyncRead + Unpin,
{
    pub async fn read_datagram(&mut self, out: &mut [u8]) -> Result<usize, ProtocolError> {
        let n = self.inner.read_u32().await?;
        if n > MAX_DATAGRAM_BYTES {
            return Err(ProtocolError::PayloadTooLarge(n));
        }
        let n = n as usize;
        if n > out.len() {
            // Drain to keep stream aligned.
            let mut drain = vec![0u8; n];
            self.inner.read_exact(&mut drain).await?;
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "short buffer",
            )));
        }
        self.inner.read_exact(&mut out[..n]).await?;
        Ok(n)
    }
}

/// Writing half of datagram framing over a byte stream.
pub struct DatagramWriter<W> {
    inner: W,
}

impl<W> DatagramWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W> DatagramWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub async fn write_datagram(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let n: u32 = payload
            .len()
            .try_into()
            .map_err(|_| ProtocolError::PayloadTooLarge(u32::MAX))?;
        if n > MAX_DATAGRAM_BYTES {
            return Err(ProtocolError::PayloadTooLarge(n));
        }
        self.inner.write_u32(n).await?;
        self.inner.write_all(payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}
