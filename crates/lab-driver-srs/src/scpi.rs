//! SCPI over TCP communication helpers for the DG645.
//!
//! The DG645 exposes a bare-socket SCPI interface on port 5025. Commands are
//! `\n`-terminated; responses arrive as `\r\n`-terminated lines. This module
//! provides an async client handling connection management, command/query
//! round-trips and response parsing, plus a mock client simulating the
//! instrument's command subset for tests.

use anyhow::{Context, Result};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Default bare-socket SCPI port for the DG645
pub const DEFAULT_PORT: u16 = 5025;

/// Default command timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Async SCPI client for TCP communication with the DG645
pub struct ScpiClient {
    stream: Mutex<BufReader<TcpStream>>,
    timeout: Duration,
}

impl ScpiClient {
    /// Create a new SCPI client connected to the specified host and port.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("Invalid address: {}:{}", host, port))?;

        let stream = timeout(Duration::from_secs(5), TcpStream::connect(addr))
            .await
            .with_context(|| format!("Connection timeout to {}:{}", host, port))?
            .with_context(|| format!("Failed to connect to {}:{}", host, port))?;

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        tracing::info!("Connected to delay generator at {}:{}", host, port);

        Ok(Self {
            stream: Mutex::new(BufReader::new(stream)),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        })
    }

    /// Set the command timeout duration.
    pub fn set_timeout(&mut self, duration: Duration) {
        self.timeout = duration;
    }

    /// Send a command without expecting a response.
    ///
    /// # Arguments
    /// * `command` - SCPI command string (e.g., "DLAY 2,0,2.4e-4")
    pub async fn write(&self, command: &str) -> Result<()> {
        let mut stream = self.stream.lock().await;

        let cmd = format!("{}\n", command);
        tracing::debug!("SCPI write: {:?}", cmd.trim());

        stream
            .get_mut()
            .write_all(cmd.as_bytes())
            .await
            .with_context(|| format!("Failed to write command: {}", command))?;

        stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush stream")?;

        // Small delay for command processing
        tokio::time::sleep(Duration::from_millis(10)).await;

        Ok(())
    }

    /// Send a query and read the response.
    ///
    /// # Arguments
    /// * `query` - SCPI query string (e.g., "LERR?")
    ///
    /// # Returns
    /// Trimmed response string
    pub async fn query(&self, query: &str) -> Result<String> {
        let mut stream = self.stream.lock().await;

        // Clear any pending data in the buffer
        Self::flush_input_buffer(&mut stream).await?;

        let cmd = format!("{}\n", query);
        tracing::debug!("SCPI query: {:?}", cmd.trim());

        stream
            .get_mut()
            .write_all(cmd.as_bytes())
            .await
            .with_context(|| format!("Failed to write query: {}", query))?;

        stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush stream")?;

        // Read response with timeout
        let mut response = String::new();
        let result = timeout(self.timeout, stream.read_line(&mut response)).await;

        match result {
            Ok(Ok(0)) => anyhow::bail!("Connection closed by device"),
            Ok(Ok(_)) => {
                let trimmed = response.trim().to_string();
                tracing::debug!("SCPI response: {:?}", trimmed);
                Ok(trimmed)
            }
            Ok(Err(e)) => Err(e).context("Failed to read response"),
            Err(_) => anyhow::bail!("Timeout waiting for response to: {}", query),
        }
    }

    /// Query a floating-point value.
    pub async fn query_f64(&self, query: &str) -> Result<f64> {
        let response = self.query(query).await?;
        response.parse::<f64>().with_context(|| {
            format!(
                "Failed to parse '{}' as f64 from query: {}",
                response, query
            )
        })
    }

    /// Query an integer value.
    pub async fn query_int(&self, query: &str) -> Result<i64> {
        let response = self.query(query).await?;
        response.parse::<i64>().with_context(|| {
            format!(
                "Failed to parse '{}' as integer from query: {}",
                response, query
            )
        })
    }

    /// Clear any pending data from the input buffer.
    async fn flush_input_buffer(stream: &mut BufReader<TcpStream>) -> Result<()> {
        // Consume any data in BufReader's internal buffer
        {
            let buf = stream.buffer();
            if !buf.is_empty() {
                tracing::debug!("Flushing {} bytes from buffer", buf.len());
                let len = buf.len();
                stream.consume(len);
            }
        }

        // Try to read any pending data from the socket
        let mut discard = vec![0u8; 256];
        loop {
            match timeout(
                Duration::from_millis(10),
                stream.get_mut().peek(&mut discard),
            )
            .await
            {
                Ok(Ok(0)) | Err(_) => break, // No data or timeout
                Ok(Ok(n)) => {
                    let mut consume_buf = vec![0u8; n];
                    let _ = stream.get_mut().try_read(&mut consume_buf);
                    tracing::debug!("Flushed {} stale bytes from stream", n);
                }
                Ok(Err(_)) => break,
            }
        }

        Ok(())
    }
}

/// Mock SCPI client simulating the DG645 command subset for tests.
pub struct MockScpiClient {
    state: Mutex<MockState>,
}

struct MockState {
    trigger_level: f64,
    trigger_source: u8,
    /// channel -> (link channel, delay seconds)
    delays: HashMap<u8, (u8, f64)>,
    error_queue: VecDeque<u8>,
    /// Every command seen, for assertions
    command_log: Vec<String>,
}

impl Default for MockScpiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockScpiClient {
    /// Create a new mock client with power-on defaults.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                trigger_level: 1.0,
                trigger_source: 0,
                delays: HashMap::new(),
                error_queue: VecDeque::new(),
                command_log: Vec::new(),
            }),
        }
    }

    /// Commands received so far (for test assertions).
    pub async fn command_log(&self) -> Vec<String> {
        self.state.lock().await.command_log.clone()
    }

    /// Queue an error code, as the instrument would on a bad command.
    pub async fn push_error(&self, code: u8) {
        self.state.lock().await.error_queue.push_back(code);
    }

    /// Send a command without expecting a response.
    pub async fn write(&self, command: &str) -> Result<()> {
        tracing::debug!("Mock SCPI write: {}", command);
        let mut state = self.state.lock().await;
        state.command_log.push(command.to_string());

        let (head, args) = match command.split_once(' ') {
            Some((h, a)) => (h, a),
            None => (command, ""),
        };

        match head.to_uppercase().as_str() {
            "*RST" => {
                state.trigger_level = 1.0;
                state.trigger_source = 0;
                state.delays.clear();
            }
            "*CLS" => state.error_queue.clear(),
            "*TRG" => {}
            "TLVL" => {
                let level: f64 = args.trim().parse().unwrap_or(f64::NAN);
                if level.is_finite() && (-3.5..=3.5).contains(&level) {
                    state.trigger_level = level;
                } else {
                    state.error_queue.push_back(63); // invalid voltage
                }
            }
            "TSRC" => match args.trim().parse::<u8>() {
                Ok(src) if src <= 6 => state.trigger_source = src,
                _ => state.error_queue.push_back(30), // invalid trigger source
            },
            "DLAY" => {
                let parts: Vec<&str> = args.split(',').map(str::trim).collect();
                let parsed = match parts.as_slice() {
                    [c, d, t] => match (c.parse::<u8>(), d.parse::<u8>(), t.parse::<f64>()) {
                        (Ok(c), Ok(d), Ok(t)) if c <= 9 && d <= 9 && t >= 0.0 => Some((c, d, t)),
                        _ => None,
                    },
                    _ => None,
                };
                match parsed {
                    Some((channel, link, delay)) => {
                        state.delays.insert(channel, (link, delay));
                    }
                    None => state.error_queue.push_back(41), // invalid delay
                }
            }
            _ => state.error_queue.push_back(10), // device dependent error
        }
        Ok(())
    }

    /// Send a query and read the response.
    pub async fn query(&self, query: &str) -> Result<String> {
        tracing::debug!("Mock SCPI query: {}", query);
        let mut state = self.state.lock().await;
        state.command_log.push(query.to_string());

        let upper = query.to_uppercase();
        if upper == "*IDN?" {
            return Ok("Stanford Research Systems,DG645,s/n004596,ver1.17.1E".to_string());
        }
        if upper == "*OPC?" {
            return Ok("1".to_string());
        }
        if upper == "LERR?" {
            let code = state.error_queue.pop_front().unwrap_or(0);
            return Ok(code.to_string());
        }
        if upper == "TLVL?" {
            return Ok(format!("{:+.2}", state.trigger_level));
        }
        if upper == "TSRC?" {
            return Ok(state.trigger_source.to_string());
        }
        if let Some(channel) = upper.strip_prefix("DLAY?") {
            let channel: u8 = channel
                .trim()
                .parse()
                .with_context(|| format!("bad DLAY? channel in: {}", query))?;
            let (link, delay) = state.delays.get(&channel).copied().unwrap_or((0, 0.0));
            return Ok(format!("{},{:+.12}", link, delay));
        }

        anyhow::bail!("Unknown mock query: {}", query)
    }

    /// Query a floating-point value.
    pub async fn query_f64(&self, query: &str) -> Result<f64> {
        let response = self.query(query).await?;
        response
            .parse::<f64>()
            .with_context(|| format!("Failed to parse '{}' as f64", response))
    }

    /// Query an integer value.
    pub async fn query_int(&self, query: &str) -> Result<i64> {
        let response = self.query(query).await?;
        response
            .parse::<i64>()
            .with_context(|| format!("Failed to parse '{}' as integer", response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_idn_and_opc() {
        let client = MockScpiClient::new();
        let idn = client.query("*IDN?").await.unwrap();
        assert!(idn.contains("DG645"));
        assert_eq!(client.query("*OPC?").await.unwrap(), "1");
    }

    #[tokio::test]
    async fn test_mock_trigger_level_roundtrip() {
        let client = MockScpiClient::new();
        client.write("TLVL 1.3").await.unwrap();
        let level = client.query_f64("TLVL?").await.unwrap();
        assert!((level - 1.3).abs() < 0.01);
        // No errors queued
        assert_eq!(client.query_int("LERR?").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mock_rejects_bad_trigger_level() {
        let client = MockScpiClient::new();
        client.write("TLVL 99").await.unwrap();
        assert_eq!(client.query_int("LERR?").await.unwrap(), 63);
        // Queue drains to 0
        assert_eq!(client.query_int("LERR?").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mock_delay_roundtrip() {
        let client = MockScpiClient::new();
        client.write("DLAY 2,0,2.4e-4").await.unwrap();
        let response = client.query("DLAY?2").await.unwrap();
        let (link, delay) = response.split_once(',').unwrap();
        assert_eq!(link, "0");
        assert!((delay.parse::<f64>().unwrap() - 2.4e-4).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_mock_unknown_command_queues_error() {
        let client = MockScpiClient::new();
        client.write("BOGUS 1").await.unwrap();
        assert_eq!(client.query_int("LERR?").await.unwrap(), 10);
    }
}
