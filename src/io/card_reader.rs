//! Card reader backends
//!
//! A reader yields one card id per presentation. Backends:
//! - `SerialCardReader` - reader module on a serial port, one id per line
//! - `StdinCardReader` - ids typed or piped on standard input
//! - `ChannelCardReader` - ids pushed from another task (keypads, tests)
//!
//! Ids that are not plain ASCII alphanumeric are read failures.

use crate::domain::types::CardId;
use crate::infra::config::{CardReaderKind, Config};
use anyhow::{bail, Context};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::sync::mpsc;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

#[async_trait]
pub trait CardReader: Send {
    /// Block until a card is presented.
    ///
    /// `Ok(None)` means the reader is gone for good (end of input).
    async fn read_id(&mut self) -> anyhow::Result<Option<CardId>>;

    fn name(&self) -> &'static str;
}

/// Build the reader selected in the config
pub fn from_config(config: &Config) -> Box<dyn CardReader> {
    match config.card_reader() {
        CardReaderKind::Serial => Box::new(SerialCardReader::new(config.card_device(), config.card_baud())),
        CardReaderKind::Stdin => Box::new(StdinCardReader::new()),
    }
}

fn parse_line(line: &str) -> anyhow::Result<Option<CardId>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match CardId::parse(trimmed) {
        Some(id) => Ok(Some(id)),
        None => bail!("unreadable card id {trimmed:?}"),
    }
}

/// Read lines until one carries a card id. Blank lines are skipped.
async fn next_id<R: AsyncRead + Unpin + Send>(lines: &mut Lines<BufReader<R>>) -> anyhow::Result<Option<CardId>> {
    while let Some(line) = lines.next_line().await? {
        if let Some(id) = parse_line(&line)? {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

/// Reader module on a serial port. The port is opened on first use and
/// reopened after any I/O failure.
pub struct SerialCardReader {
    device: String,
    baud: u32,
    lines: Option<Lines<BufReader<SerialStream>>>,
}

impl SerialCardReader {
    pub fn new(device: &str, baud: u32) -> Self {
        Self { device: device.to_string(), baud, lines: None }
    }

    fn open(&self) -> anyhow::Result<Lines<BufReader<SerialStream>>> {
        let port = tokio_serial::new(&self.device, self.baud)
            .timeout(Duration::from_millis(500))
            .open_native_async()
            .with_context(|| format!("failed to open card reader {}", self.device))?;
        info!(device = %self.device, baud = %self.baud, "card_reader_opened");
        Ok(BufReader::new(port).lines())
    }
}

#[async_trait]
impl CardReader for SerialCardReader {
    async fn read_id(&mut self) -> anyhow::Result<Option<CardId>> {
        if self.lines.is_none() {
            self.lines = Some(self.open()?);
        }
        let Some(lines) = self.lines.as_mut() else {
            bail!("card reader {} not open", self.device);
        };

        loop {
            match next_id(lines).await {
                // A serial port has no end of input; treat it as unplugged
                Ok(None) => {
                    self.lines = None;
                    bail!("card reader {} closed", self.device);
                }
                Ok(Some(id)) => return Ok(Some(id)),
                Err(e) => match e.downcast_ref::<std::io::Error>().map(std::io::Error::kind) {
                    Some(std::io::ErrorKind::TimedOut) => continue,
                    Some(_) => {
                        self.lines = None;
                        return Err(e.context(format!("card reader {} read failed", self.device)));
                    }
                    None => return Err(e),
                },
            }
        }
    }

    fn name(&self) -> &'static str {
        CardReaderKind::Serial.as_str()
    }
}

/// Card ids from standard input, one per line.
///
/// A pending stdin read cannot be cancelled, so process exit waits for the
/// next line (or end of input).
pub struct StdinCardReader {
    lines: Lines<BufReader<tokio::io::Stdin>>,
}

impl StdinCardReader {
    pub fn new() -> Self {
        Self { lines: BufReader::new(tokio::io::stdin()).lines() }
    }
}

impl Default for StdinCardReader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CardReader for StdinCardReader {
    async fn read_id(&mut self) -> anyhow::Result<Option<CardId>> {
        next_id(&mut self.lines).await
    }

    fn name(&self) -> &'static str {
        CardReaderKind::Stdin.as_str()
    }
}

/// Raw reads pushed over a channel
pub struct ChannelCardReader {
    rx: mpsc::UnboundedReceiver<String>,
}

impl ChannelCardReader {
    pub fn new() -> (mpsc::UnboundedSender<String>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl CardReader for ChannelCardReader {
    async fn read_id(&mut self) -> anyhow::Result<Option<CardId>> {
        loop {
            let Some(raw) = self.rx.recv().await else {
                return Ok(None);
            };
            if let Some(id) = parse_line(&raw)? {
                return Ok(Some(id));
            }
        }
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}
