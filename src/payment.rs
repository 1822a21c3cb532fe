//! Card payment terminal client (eSocket.POS dialect over TCP).
//!
//! Each request is one length-prefixed XML body, answered by one
//! length-prefixed XML body. The client never retries on its own: a timeout
//! or I/O failure drops the connection and surfaces as an error, and the
//! coordinator decides what happens to the transaction.

use std::time::Duration;

use anyhow::Result;
use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::{timeout, Instant},
};

use crate::backoff::Backoff;

pub mod xml;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PaymentOutcome {
    pub approved: bool,
    pub raw: String,
}

/// The seam the coordinator talks through; the real client below, a scripted
/// mock in tests.
#[async_trait]
pub trait PaymentTerminal: Send {
    async fn purchase(&mut self, txn_id: &str, amount_minor: u32) -> Result<PaymentOutcome>;
    async fn reversal(
        &mut self,
        txn_id: &str,
        original_txn_id: &str,
        reason: &str,
    ) -> Result<PaymentOutcome>;
    async fn close(&mut self) -> Result<()>;
    /// Forget the connection after an abandoned in-flight request, so a late
    /// response can never be mistaken for the answer to the next one.
    fn abort(&mut self);
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("gateway request timed out")]
    Timeout,
    #[error("gateway i/o: {0}")]
    Io(#[from] io::Error),
    #[error("terminal initialization refused by gateway")]
    InitRefused,
    #[error("gateway unavailable, reconnect backoff active")]
    Unavailable,
}

#[derive(Debug)]
pub struct PaymentClient {
    host: String,
    port: u16,
    terminal_id: String,
    currency: String,
    stream: Option<TcpStream>,
    session_open: bool,
    backoff: Backoff,
    retry_after: Option<Instant>,
}

impl PaymentClient {
    pub fn new(host: &str, port: u16, terminal_id: &str, currency: &str) -> Self {
        Self {
            host: host.to_owned(),
            port,
            terminal_id: terminal_id.to_owned(),
            currency: currency.to_owned(),
            stream: None,
            session_open: false,
            backoff: Backoff::reconnect(),
            retry_after: None,
        }
    }

    /// Dial the gateway, pacing repeated failures so a dead gateway does not
    /// get hammered once per keypad press.
    async fn connect(&mut self) -> Result<(), PaymentError> {
        if let Some(at) = self.retry_after {
            if Instant::now() < at {
                return Err(PaymentError::Unavailable);
            }
        }
        match TcpStream::connect((self.host.as_str(), self.port)).await {
            Ok(stream) => {
                info!(host = %self.host, port = self.port, "connected to payment gateway");
                self.stream = Some(stream);
                self.session_open = false;
                self.retry_after = None;
                self.backoff.reset();
                Ok(())
            }
            Err(e) => {
                let delay = self.backoff.next_delay();
                warn!("payment gateway unreachable (retrying after {delay:?}): {e}");
                self.retry_after = Some(Instant::now() + delay);
                Err(e.into())
            }
        }
    }

    /// Register the terminal with the gateway. Success requires an APPROVE.
    pub async fn initialize(&mut self) -> Result<PaymentOutcome, PaymentError> {
        let body = xml::init(&self.terminal_id);
        let raw = self.request(&body).await?;
        let approved = xml::is_approved(&raw);
        if approved {
            info!(terminal = %self.terminal_id, "payment terminal initialized");
            self.session_open = true;
        } else {
            warn!(terminal = %self.terminal_id, "terminal initialization not approved");
        }
        Ok(PaymentOutcome { approved, raw })
    }

    /// Connect and INIT lazily so a dead gateway only costs the transaction
    /// that actually needed it.
    async fn ensure_session(&mut self) -> Result<(), PaymentError> {
        if self.stream.is_none() {
            self.connect().await?;
        }
        if !self.session_open {
            let outcome = self.initialize().await?;
            if !outcome.approved {
                self.reset();
                return Err(PaymentError::InitRefused);
            }
        }
        Ok(())
    }

    async fn request(&mut self, body: &str) -> Result<String, PaymentError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let exchange = async {
            write_frame(stream, body.as_bytes()).await?;
            read_frame(stream).await
        };
        match timeout(REQUEST_TIMEOUT, exchange).await {
            Ok(Ok(raw)) => Ok(raw),
            Ok(Err(e)) => {
                warn!("payment gateway i/o error: {e}");
                self.reset();
                Err(e.into())
            }
            Err(_) => {
                warn!("payment gateway request timed out");
                self.reset();
                Err(PaymentError::Timeout)
            }
        }
    }

    fn reset(&mut self) {
        self.stream = None;
        self.session_open = false;
    }
}

#[async_trait]
impl PaymentTerminal for PaymentClient {
    async fn purchase(&mut self, txn_id: &str, amount_minor: u32) -> Result<PaymentOutcome> {
        self.ensure_session().await?;
        let body = xml::purchase(&self.terminal_id, txn_id, amount_minor, &self.currency);
        let raw = self.request(&body).await?;
        Ok(PaymentOutcome {
            approved: xml::is_approved(&raw),
            raw,
        })
    }

    async fn reversal(
        &mut self,
        txn_id: &str,
        original_txn_id: &str,
        reason: &str,
    ) -> Result<PaymentOutcome> {
        self.ensure_session().await?;
        let body = xml::reversal(&self.terminal_id, txn_id, original_txn_id, reason);
        let raw = self.request(&body).await?;
        Ok(PaymentOutcome {
            approved: xml::is_approved(&raw),
            raw,
        })
    }

    async fn close(&mut self) -> Result<()> {
        if self.stream.is_none() {
            return Ok(());
        }
        let body = xml::close(&self.terminal_id);
        let raw = self.request(&body).await?;
        if !xml::is_approved(&raw) {
            warn!("terminal close not approved by gateway");
        }
        self.reset();
        Ok(())
    }

    fn abort(&mut self) {
        self.reset();
    }
}

/// `length || utf8 body`; two-byte big-endian length, or `0xFF 0xFF` plus a
/// four-byte length for bodies that do not fit.
async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, body: &[u8]) -> io::Result<()> {
    if body.len() < 0xFFFF {
        stream.write_all(&(body.len() as u16).to_be_bytes()).await?;
    } else {
        stream.write_all(&[0xFF, 0xFF]).await?;
        stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    }
    stream.write_all(body).await?;
    stream.flush().await
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<String> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let length = if header == [0xFF, 0xFF] {
        let mut extended = [0u8; 4];
        stream.read_exact(&mut extended).await?;
        u32::from_be_bytes(extended) as usize
    } else {
        u16::from_be_bytes(header) as usize
    };
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;
    String::from_utf8(body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
