//! Transport adapters: one physical or network connection to a mesh radio.
//!
//! A [`Connector`] knows how to (re)open the link; each successful connect yields a
//! [`Link`] split into a reader half (raw byte chunks in) and a writer half (whole
//! frames out). The supervisor owns the link and is the only caller.
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use log::debug;
#[cfg(feature = "serial")]
use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::errors::TransportError;

#[cfg(feature = "serial")]
use serialport::SerialPort;

const READ_CHUNK: usize = 1024;

/// Opens links to a radio. Called again by the supervisor after every disconnect.
pub trait Connector: Send + Sync + 'static {
    /// Human readable target for logs (`/dev/ttyUSB0`, `10.0.0.5:4403`).
    fn describe(&self) -> String;

    fn connect(&self) -> impl Future<Output = Result<Link, TransportError>> + Send;
}

/// An open connection, split for concurrent reading and writing.
pub struct Link {
    pub reader: LinkReader,
    pub writer: LinkWriter,
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

pub enum LinkReader {
    /// Async byte stream (TCP, in-memory loopback).
    Stream(BoxedRead),
    /// Chunks pumped by a blocking reader thread (serial ports).
    Chunks(mpsc::Receiver<std::io::Result<Vec<u8>>>),
}

impl LinkReader {
    /// Wait for the next chunk of raw bytes. Cancel-safe: no bytes are lost if the
    /// returned future is dropped before completion.
    pub async fn read_chunk(&mut self) -> Result<Vec<u8>, TransportError> {
        match self {
            LinkReader::Stream(r) => {
                let mut buf = vec![0u8; READ_CHUNK];
                let n = r.read(&mut buf).await?;
                if n == 0 {
                    return Err(TransportError::Closed);
                }
                buf.truncate(n);
                Ok(buf)
            }
            LinkReader::Chunks(rx) => match rx.recv().await {
                Some(Ok(chunk)) => Ok(chunk),
                Some(Err(e)) => Err(TransportError::Io(e)),
                None => Err(TransportError::Closed),
            },
        }
    }
}

pub enum LinkWriter {
    Stream(BoxedWrite),
    #[cfg(feature = "serial")]
    Serial(Arc<Mutex<Box<dyn SerialPort>>>),
}

impl LinkWriter {
    /// Write one complete frame and flush it to the device.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        match self {
            LinkWriter::Stream(w) => {
                w.write_all(frame).await?;
                w.flush().await?;
                Ok(())
            }
            #[cfg(feature = "serial")]
            LinkWriter::Serial(port) => {
                use std::io::Write;
                let port = port.clone();
                let frame = frame.to_vec();
                tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                    let mut guard = port
                        .lock()
                        .map_err(|_| std::io::Error::other("serial port mutex poisoned"))?;
                    guard.write_all(&frame)?;
                    guard.flush()
                })
                .await
                .map_err(|e| TransportError::Io(std::io::Error::other(e)))??;
                Ok(())
            }
        }
    }
}

/// Connector built from `[transport]` configuration.
#[derive(Debug, Clone)]
pub enum DeviceConnector {
    Serial { port: String, baud_rate: u32 },
    Tcp { address: String },
}

impl Connector for DeviceConnector {
    fn describe(&self) -> String {
        match self {
            DeviceConnector::Serial { port, baud_rate } => format!("{} @ {} baud", port, baud_rate),
            DeviceConnector::Tcp { address } => format!("tcp://{}", address),
        }
    }

    async fn connect(&self) -> Result<Link, TransportError> {
        match self {
            DeviceConnector::Tcp { address } => {
                debug!("Connecting to radio at tcp://{}", address);
                let stream =
                    TcpStream::connect(address)
                        .await
                        .map_err(|e| TransportError::Open {
                            target: address.clone(),
                            reason: e.to_string(),
                        })?;
                let _ = stream.set_nodelay(true);
                let (r, w) = stream.into_split();
                Ok(Link {
                    reader: LinkReader::Stream(Box::new(r)),
                    writer: LinkWriter::Stream(Box::new(w)),
                })
            }
            #[cfg(feature = "serial")]
            DeviceConnector::Serial { port, baud_rate } => open_serial(port, *baud_rate).await,
            #[cfg(not(feature = "serial"))]
            DeviceConnector::Serial { port, .. } => Err(TransportError::Open {
                target: port.clone(),
                reason: "built without the 'serial' feature".to_string(),
            }),
        }
    }
}

#[cfg(feature = "serial")]
async fn open_serial(port_name: &str, baud_rate: u32) -> Result<Link, TransportError> {
    use std::time::Duration;

    debug!("Opening serial port {} at {} baud", port_name, baud_rate);
    let open_err = |e: serialport::Error| TransportError::Open {
        target: port_name.to_string(),
        reason: e.to_string(),
    };

    let mut builder = serialport::new(port_name, baud_rate).timeout(Duration::from_millis(100));
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let mut port = builder.open().map_err(open_err)?;

    // Toggle DTR/RTS to ensure the device wakes
    let _ = port.write_data_terminal_ready(true);
    let _ = port.write_request_to_send(true);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut read_port = port.try_clone().map_err(open_err)?;
    let (tx, rx) = mpsc::channel::<std::io::Result<Vec<u8>>>(64);
    let thread_name = format!("serial-rx {}", port_name);
    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match read_port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        if tx.is_closed() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("Serial read error: {}", e);
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
            debug!("Serial reader thread exiting");
        })
        .map_err(|e| TransportError::Open {
            target: port_name.to_string(),
            reason: e.to_string(),
        })?;

    debug!("Serial port {} initialized", port_name);
    Ok(Link {
        reader: LinkReader::Chunks(rx),
        writer: LinkWriter::Serial(Arc::new(Mutex::new(port))),
    })
}

/// In-memory loopback connector. Each [`MemoryConnector::plug`] queues one link for the
/// next `connect`; the returned stream is the radio side of that link. With nothing
/// queued, `connect` fails like an unplugged device would.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    pending: Arc<Mutex<VecDeque<DuplexStream>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a link and return its radio end.
    pub fn plug(&self) -> DuplexStream {
        let (gateway_end, radio_end) = tokio::io::duplex(16 * 1024);
        if let Ok(mut q) = self.pending.lock() {
            q.push_back(gateway_end);
        }
        radio_end
    }
}

impl Connector for MemoryConnector {
    fn describe(&self) -> String {
        "memory loopback".to_string()
    }

    async fn connect(&self) -> Result<Link, TransportError> {
        let next = self.pending.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(stream) => {
                let (r, w) = tokio::io::split(stream);
                Ok(Link {
                    reader: LinkReader::Stream(Box::new(r)),
                    writer: LinkWriter::Stream(Box::new(w)),
                })
            }
            None => Err(TransportError::Open {
                target: self.describe(),
                reason: "no link plugged".to_string(),
            }),
        }
    }
}
