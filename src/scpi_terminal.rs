use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Raw socket port used by Rigol and most LXI instruments.
pub const SCPI_RAW_PORT: u16 = 5555;

const POLL_TIMEOUT: Duration = Duration::from_millis(10);
const LINE_END: u8 = b'\n';

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout error: no complete response after {waited:?} ({received} bytes buffered)")]
    Timeout { waited: Duration, received: usize },

    #[error("Connection closed by instrument")]
    ConnectionClosed,

    #[error("Malformed binary block: {0}")]
    MalformedBlock(String),

    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl TerminalError {
    /// True when the failure means the stream itself is gone, not just slow.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(e) => matches!(
                e.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            ),
            Self::SerialPort(e) => matches!(e.kind(), serialport::ErrorKind::NoDevice),
            _ => false,
        }
    }
}

/// Line/block oriented SCPI byte stream.
pub trait ScpiTransport: Send {
    fn send_line(&mut self, line: &str) -> Result<(), TerminalError>;

    /// Read one response line without its terminator.
    fn read_line(&mut self, timeout: Duration) -> Result<String, TerminalError>;

    /// Read an IEEE 488.2 block (`#<n><len><payload>`) and return the payload.
    fn read_block(&mut self, timeout: Duration) -> Result<Vec<u8>, TerminalError>;

    /// Drop whatever the instrument sent that nobody asked for.
    fn clear_input(&mut self) -> Result<(), TerminalError>;
}

/// SCPI terminal over any blocking byte stream whose reads time out quickly.
pub struct StreamTerminal<S> {
    stream: S,
    read_buf: Vec<u8>,
}

pub type TcpTerminal = StreamTerminal<TcpStream>;
pub type SerialTerminal = StreamTerminal<Box<dyn SerialPort>>;

impl StreamTerminal<TcpStream> {
    /// Open the raw SCPI socket of a LAN instrument.
    pub fn connect_tcp<A: ToSocketAddrs>(addr: A, connect_timeout: Duration) -> Result<Self, TerminalError> {
        let mut last_err = None;
        for candidate in addr.to_socket_addrs()? {
            log::debug!("Connecting to SCPI socket {}", candidate);
            match TcpStream::connect_timeout(&candidate, connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(POLL_TIMEOUT))?;
                    return Ok(Self::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| std::io::Error::new(ErrorKind::NotFound, "address resolved to nothing"))
            .into())
    }
}

impl StreamTerminal<Box<dyn SerialPort>> {
    /// Open a USB/RS-232 SCPI port.
    pub fn open_serial(port: &str, baud_rate: u32) -> Result<Self, TerminalError> {
        log::debug!("Opening SCPI serial port {} at {} baud", port, baud_rate);
        let serial = serialport::new(port, baud_rate).timeout(POLL_TIMEOUT).open()?;
        serial.clear(serialport::ClearBuffer::All)?;
        Ok(Self::new(serial))
    }
}

impl<S: Read + Write> StreamTerminal<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::with_capacity(256),
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Pull more bytes into the buffer; `Ok(false)` means the poll timed out.
    fn fill(&mut self) -> Result<bool, TerminalError> {
        let mut chunk = [0u8; 4096];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(TerminalError::ConnectionClosed),
            Ok(n) => {
                self.read_buf.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Keep filling until `count` bytes are buffered or the deadline passes.
    fn fill_to(&mut self, count: usize, start: Instant, timeout: Duration) -> Result<(), TerminalError> {
        while self.read_buf.len() < count {
            if !self.fill()? && start.elapsed() >= timeout {
                return Err(TerminalError::Timeout {
                    waited: start.elapsed(),
                    received: self.read_buf.len(),
                });
            }
        }
        Ok(())
    }

    fn take(&mut self, count: usize) -> Vec<u8> {
        let rest = self.read_buf.split_off(count);
        std::mem::replace(&mut self.read_buf, rest)
    }

    fn line_end_from(&self, from: usize) -> Option<usize> {
        self.read_buf[from..].iter().position(|&b| b == LINE_END).map(|p| p + from)
    }
}

impl<S: Read + Write + Send> ScpiTransport for StreamTerminal<S> {
    fn send_line(&mut self, line: &str) -> Result<(), TerminalError> {
        let command_with_newline = format!("{}\n", line.trim_end());
        self.stream.write_all(command_with_newline.as_bytes())?;
        self.stream.flush()?;
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String, TerminalError> {
        let start = Instant::now();
        let mut scanned = 0;
        loop {
            if let Some(end) = self.line_end_from(scanned) {
                let mut line = self.take(end + 1);
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(String::from_utf8(line)?);
            }
            scanned = self.read_buf.len();
            if !self.fill()? && start.elapsed() >= timeout {
                return Err(TerminalError::Timeout {
                    waited: start.elapsed(),
                    received: self.read_buf.len(),
                });
            }
        }
    }

    fn read_block(&mut self, timeout: Duration) -> Result<Vec<u8>, TerminalError> {
        let start = Instant::now();

        self.fill_to(2, start, timeout)?;
        if self.read_buf[0] != b'#' {
            let head = String::from_utf8_lossy(&self.read_buf[..self.read_buf.len().min(16)]).to_string();
            self.read_buf.clear();
            return Err(TerminalError::MalformedBlock(format!("expected '#', got {:?}", head)));
        }
        let digits = match (self.read_buf[1] as char).to_digit(10) {
            Some(d) => d as usize,
            None => {
                self.read_buf.clear();
                return Err(TerminalError::MalformedBlock("invalid length digit count".to_string()));
            }
        };

        if digits == 0 {
            // Indefinite length block, terminated by the line end.
            loop {
                if let Some(end) = self.line_end_from(2) {
                    let mut block = self.take(end + 1);
                    block.pop();
                    return Ok(block.split_off(2));
                }
                if !self.fill()? && start.elapsed() >= timeout {
                    return Err(TerminalError::Timeout {
                        waited: start.elapsed(),
                        received: self.read_buf.len(),
                    });
                }
            }
        }

        self.fill_to(2 + digits, start, timeout)?;
        let length_text = String::from_utf8_lossy(&self.read_buf[2..2 + digits]).to_string();
        let length: usize = length_text.parse().map_err(|_| {
            self.read_buf.clear();
            TerminalError::MalformedBlock(format!("invalid block length {:?}", length_text))
        })?;

        let header = 2 + digits;
        self.fill_to(header + length, start, timeout)?;
        let _ = self.take(header);
        let payload = self.take(length);

        // The block is normally followed by a line end; eat it if it already arrived.
        if self.read_buf.first() == Some(&LINE_END) {
            let _ = self.take(1);
        }
        Ok(payload)
    }

    fn clear_input(&mut self) -> Result<(), TerminalError> {
        self.read_buf.clear();
        while self.fill()? {
            self.read_buf.clear();
        }
        Ok(())
    }
}
