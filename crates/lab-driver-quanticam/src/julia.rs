//! Sensor backend driving the QuantiCam Julia project.
//!
//! The QuantiCam sensor is operated by the lab's `QuantiCam.jl` package
//! (FPGA bring-up, gate configuration, TDC readout). This backend starts a
//! persistent `julia` worker running a small adapter loop over the package's
//! exported functions and exchanges line-oriented commands with it on
//! stdin/stdout:
//!
//! ```text
//! -> BITFILE <path>        <- OK | ERR <message>
//! -> ARM                   <- OK | ERR <message>
//! -> TRIGGER               <- OK | ERR <message>
//! -> CAPTURE <exposure_ms> <- FRAME <w> <h> followed by one line of codes
//! ```
//!
//! Requires `julia` on PATH with QuantiCam installed in the active project.

use crate::quanticam::{SensorBackend, FRAME_HEIGHT, FRAME_WIDTH};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lab_core::data::Frame;
use lab_core::error::LabError;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

/// Adapter loop evaluated in the worker; calls only functions the QuantiCam
/// package exports.
const WORKER_PROGRAM: &str = r#"
using QuantiCam
board = nothing
for line in eachline(stdin)
    parts = split(line)
    isempty(parts) && continue
    try
        cmd = parts[1]
        if cmd == "BITFILE"
            global board = QuantiCam.QCBoard(parts[2])
            println("OK")
        elseif cmd == "ARM"
            QuantiCam.arm!(board)
            println("OK")
        elseif cmd == "TRIGGER"
            QuantiCam.trigger!(board)
            println("OK")
        elseif cmd == "CAPTURE"
            frame = QuantiCam.capture(board; exposure_ms = parse(Float64, parts[2]))
            println("FRAME ", size(frame, 1), " ", size(frame, 2))
            println(join(vec(frame), " "))
        else
            println("ERR unknown command ", cmd)
        end
    catch err
        println("ERR ", err)
    end
    flush(stdout)
end
"#;

struct WorkerIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Backend that forwards sensor operations to the QuantiCam worker.
pub(crate) struct JuliaSensor {
    io: Mutex<WorkerIo>,
    _child: Child,
}

impl JuliaSensor {
    /// Start the worker process.
    pub(crate) async fn spawn() -> Result<Self> {
        let mut child = Command::new("julia")
            .arg("-e")
            .arg(WORKER_PROGRAM)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LabError::DeviceUnreachable {
                device: "QuantiCam worker".into(),
                message: format!("failed to start julia: {}", e),
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("QuantiCam worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("QuantiCam worker stdout unavailable"))?;

        tracing::info!("QuantiCam worker started");
        Ok(Self {
            io: Mutex::new(WorkerIo {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            _child: child,
        })
    }

    async fn command(&self, command: &str) -> Result<String> {
        let mut io = self.io.lock().await;
        io.stdin
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .context("QuantiCam worker write failed")?;
        io.stdin.flush().await.context("QuantiCam worker flush failed")?;

        let mut line = String::new();
        let n = io
            .stdout
            .read_line(&mut line)
            .await
            .context("QuantiCam worker read failed")?;
        if n == 0 {
            return Err(LabError::DeviceUnreachable {
                device: "QuantiCam worker".into(),
                message: "worker exited".into(),
            }
            .into());
        }
        let line = line.trim().to_string();
        if let Some(message) = line.strip_prefix("ERR ") {
            return Err(LabError::Instrument {
                device: "QuantiCam".into(),
                message: message.to_string(),
            }
            .into());
        }
        Ok(line)
    }

    async fn expect_ok(&self, command: &str) -> Result<()> {
        let reply = self.command(command).await?;
        if reply != "OK" {
            return Err(LabError::MalformedResponse {
                device: "QuantiCam".into(),
                response: reply,
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl SensorBackend for JuliaSensor {
    async fn load_bitfile(&self, path: &Path) -> Result<()> {
        self.expect_ok(&format!("BITFILE {}", path.display())).await
    }

    async fn arm(&self) -> Result<()> {
        self.expect_ok("ARM").await
    }

    async fn trigger(&self) -> Result<()> {
        self.expect_ok("TRIGGER").await
    }

    async fn capture(&self, exposure_ms: f64) -> Result<Frame> {
        let header = self.command(&format!("CAPTURE {}", exposure_ms)).await?;
        let mut fields = header.split_whitespace();
        if fields.next() != Some("FRAME") {
            return Err(LabError::MalformedResponse {
                device: "QuantiCam".into(),
                response: header,
            }
            .into());
        }
        let width: u32 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow!("QuantiCam worker: bad frame width in {:?}", header))?;
        let height: u32 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow!("QuantiCam worker: bad frame height in {:?}", header))?;
        if (width, height) != (FRAME_WIDTH, FRAME_HEIGHT) {
            return Err(anyhow!(
                "QuantiCam worker returned {}x{} frame, expected {}x{}",
                width,
                height,
                FRAME_WIDTH,
                FRAME_HEIGHT
            ));
        }

        let mut data_line = String::new();
        {
            let mut io = self.io.lock().await;
            io.stdout
                .read_line(&mut data_line)
                .await
                .context("QuantiCam worker read failed")?;
        }
        let pixels: Vec<u16> = data_line
            .split_whitespace()
            .map(|code| code.parse::<u16>())
            .collect::<Result<_, _>>()
            .map_err(|_| LabError::MalformedResponse {
                device: "QuantiCam".into(),
                response: "non-numeric TDC code in frame".into(),
            })?;

        Frame::new(width, height, pixels).ok_or_else(|| {
            LabError::MalformedResponse {
                device: "QuantiCam".into(),
                response: "frame length does not match geometry".into(),
            }
            .into()
        })
    }
}
