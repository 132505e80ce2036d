//! Serial transport: strictly sequential request/response exchanges over
//! the half-duplex link.
//!
//! A single worker task owns the byte stream and drains a queue of
//! exchanges, so exactly one request frame is ever in flight. The RS-485
//! adapter echoes the outgoing frame back; the worker consumes that echo
//! and treats the next complete frame as the response.
//!
//! Two timers guard every exchange: an internal modbus timeout armed when
//! the bytes hit the wire, and a caller-visible timeout armed at `send`.
//! Any terminal condition (timeout, checksum mismatch, decode failure,
//! write error) resolves exactly one queue entry and leaves the worker
//! ready for the next.

use crate::error::{Error, Result};
use crate::frame::AsciiFrame;
use crate::request::ModbusRequest;
use log::{trace, warn};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_serial::SerialPortBuilderExt;

/// Expected response latency class of a request.
///
/// LOG.SET registers answer within half a second; anything else can take
/// the device two seconds or more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    Fast,
    Normal,
}

/// Transport timer configuration. The defaults match the device; tests
/// shrink them.
#[derive(Debug, Clone)]
pub struct Timing {
    /// Modbus timeout for [`TimeoutClass::Fast`] requests.
    pub fast: Duration,
    /// Modbus timeout for [`TimeoutClass::Normal`] requests.
    pub normal: Duration,
    /// Margin added to the modbus timeout before the worker gives up.
    pub margin: Duration,
    /// Extra slack on top of the modbus timeout for the caller-visible
    /// timeout (covers queueing delay ahead of the request).
    pub caller_extra: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            fast: Duration::from_millis(500),
            normal: Duration::from_millis(2100),
            margin: Duration::from_millis(300),
            caller_extra: Duration::from_millis(1000),
        }
    }
}

impl Timing {
    fn base(&self, class: TimeoutClass) -> Duration {
        match class {
            TimeoutClass::Fast => self.fast,
            TimeoutClass::Normal => self.normal,
        }
    }

    fn modbus_timeout(&self, class: TimeoutClass) -> Duration {
        self.base(class) + self.margin
    }

    fn caller_timeout(&self, class: TimeoutClass) -> Duration {
        self.base(class) + self.caller_extra
    }
}

struct Exchange {
    request: AsciiFrame,
    class: TimeoutClass,
    done: oneshot::Sender<Result<AsciiFrame>>,
}

/// Handle to the serial link. Cloning shares the same queue and worker;
/// the single-flight discipline holds across all clones.
#[derive(Clone)]
pub struct ModbusSerial {
    queue: mpsc::UnboundedSender<Exchange>,
    timing: Timing,
}

impl ModbusSerial {
    /// Opens the serial device (8N1, no flow control) and starts the
    /// worker task.
    pub fn open(device: &str, baud_rate: u32, timing: Timing) -> Result<Self> {
        let port = tokio_serial::new(device, baud_rate)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .data_bits(tokio_serial::DataBits::Eight)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|err| Error::Io(std::io::Error::other(err)))?;
        Ok(Self::attach(port, timing))
    }

    /// Attaches to an already-open byte stream. Used by `open` and by
    /// tests that substitute an in-memory duplex channel.
    pub fn attach<S>(stream: S, timing: Timing) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(stream, rx, timing.clone()));
        Self { queue, timing }
    }

    /// Queues `request` and waits for its response frame.
    ///
    /// The request is written once it reaches the head of the queue; the
    /// returned future resolves exactly once, with the response or with
    /// the terminal error of this exchange.
    pub async fn send(&self, request: &ModbusRequest, class: TimeoutClass) -> Result<AsciiFrame> {
        let (done, rx) = oneshot::channel();
        let exchange = Exchange {
            request: request.frame().clone(),
            class,
            done,
        };
        self.queue
            .send(exchange)
            .map_err(|_| Error::TransportClosed)?;
        let bound = self.timing.caller_timeout(class);
        match tokio::time::timeout(bound, rx).await {
            Err(_) => Err(Error::Timeout(bound)),
            Ok(Err(_)) => Err(Error::TransportClosed),
            Ok(Ok(result)) => result,
        }
    }
}

/// Reassembles frames from the raw byte stream. A frame-start marker seen
/// mid-accumulation discards the partial frame (desynchronization
/// recovery); bytes outside any frame are dropped.
struct FrameAssembler {
    buf: String,
}

impl FrameAssembler {
    fn new() -> Self {
        Self { buf: String::new() }
    }

    fn reset(&mut self) {
        self.buf.clear();
    }

    fn push(&mut self, byte: u8) -> Option<String> {
        let c = byte as char;
        if c == ':' {
            if !self.buf.is_empty() {
                warn!("unexpected start of frame, discarding {:?}", self.buf);
            }
            self.buf.clear();
            self.buf.push(':');
            None
        } else if self.buf.is_empty() {
            trace!("byte 0x{byte:02X} outside frame, dropped");
            None
        } else if c == '\n' {
            self.buf.push(c);
            Some(std::mem::take(&mut self.buf))
        } else {
            self.buf.push(c);
            None
        }
    }
}

async fn run_worker<S>(stream: S, mut rx: mpsc::UnboundedReceiver<Exchange>, timing: Timing)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let mut assembler = FrameAssembler::new();
    while let Some(exchange) = rx.recv().await {
        let result = perform_exchange(
            &mut read_half,
            &mut write_half,
            &mut assembler,
            &exchange.request,
            timing.modbus_timeout(exchange.class),
        )
        .await;
        if exchange.done.send(result).is_err() {
            warn!("requester gave up before its exchange completed");
        }
    }
}

async fn perform_exchange<R, W>(
    read_half: &mut R,
    write_half: &mut W,
    assembler: &mut FrameAssembler,
    request: &AsciiFrame,
    bound: Duration,
) -> Result<AsciiFrame>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    assembler.reset();
    write_half.write_all(request.as_str().as_bytes()).await?;
    write_half.flush().await?;

    // The modbus timeout starts only now that the bytes are on the wire.
    let receive = async {
        let mut echo_seen = false;
        let mut buf = [0u8; 256];
        loop {
            let n = read_half.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "serial stream closed",
                )));
            }
            for &byte in &buf[..n] {
                let Some(line) = assembler.push(byte) else {
                    continue;
                };
                let frame = AsciiFrame::parse(&line)?;
                if !echo_seen {
                    echo_seen = true;
                    trace!("request echo: {:?}", line.trim_end());
                    continue;
                }
                if !frame.lrc_ok() {
                    warn!("response with LRC error: {:?}", line.trim_end());
                    return Err(Error::Checksum);
                }
                trace!("response: {:?}", line.trim_end());
                return Ok(frame);
            }
        }
    };
    match tokio::time::timeout(bound, receive).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(bound)),
    }
}
