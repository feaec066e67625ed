//! Device command executor
//!
//! The only place that talks to a router. Speaks the RouterOS API framing
//! (length-prefixed words, login sentence, `!done`/`!trap` replies) over TCP,
//! with every read/write bounded by the node's timeout. Failures are
//! normalized into stable `DEVICE_*` codes here and nowhere else.

use crate::config::DeviceNode;
use async_trait::async_trait;
use fleetrelay_common::classify::{normalize_device_code, normalize_io_error};
use fleetrelay_common::error::codes;
use fleetrelay_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Hard cap on a single batch, bounding untrusted payload sizes
pub const MAX_COMMANDS: usize = 1000;

/// Result of running a command batch against one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecReport {
    pub ok: bool,
    pub host: String,
    pub dry_run: bool,
    pub errors: Vec<CommandError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandError {
    pub cmd: String,
    pub code: String,
    pub message: String,
}

/// Seam between the orchestrator and the device transport. The dry-run and
/// real implementations are selected by configuration at startup.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, node: &DeviceNode, commands: &[String]) -> Result<ExecReport>;
}

/// No-op executor for testing and staging
pub struct DryRunExecutor;

#[async_trait]
impl CommandExecutor for DryRunExecutor {
    async fn run(&self, node: &DeviceNode, commands: &[String]) -> Result<ExecReport> {
        if commands.len() > MAX_COMMANDS {
            return Ok(too_many_commands(node, true, commands.len()));
        }
        debug!(host = %node.host, commands = commands.len(), "dry-run batch");
        Ok(ExecReport {
            ok: true,
            host: node.host.clone(),
            dry_run: true,
            errors: Vec::new(),
        })
    }
}

fn too_many_commands(node: &DeviceNode, dry_run: bool, count: usize) -> ExecReport {
    ExecReport {
        ok: false,
        host: node.host.clone(),
        dry_run,
        errors: vec![CommandError {
            cmd: "VALIDATION".to_string(),
            code: codes::EVENT_INVALID_SCHEMA.to_string(),
            message: format!(
                "Too many commands: received {}, maximum allowed is {}",
                count, MAX_COMMANDS
            ),
        }],
    }
}

/// RouterOS API executor
pub struct ApiExecutor;

#[async_trait]
impl CommandExecutor for ApiExecutor {
    async fn run(&self, node: &DeviceNode, commands: &[String]) -> Result<ExecReport> {
        if commands.len() > MAX_COMMANDS {
            return Ok(too_many_commands(node, false, commands.len()));
        }

        let mut report = ExecReport {
            ok: true,
            host: node.host.clone(),
            dry_run: false,
            errors: Vec::new(),
        };

        let timeout = Duration::from_millis(node.timeout_ms);
        let mut conn = ApiConnection::connect(node, timeout).await?;
        conn.login(&node.user, &node.pass).await?;

        for (idx, cmd) in commands.iter().enumerate() {
            trace!(host = %node.host, idx, "device command");
            match conn.command(cmd).await {
                Ok(()) => {}
                Err(DeviceTrap { message }) => {
                    let code = normalize_device_code(None, &message);
                    warn!(host = %node.host, idx, code, %message, "device command failed");
                    report.ok = false;
                    report.errors.push(CommandError {
                        cmd: format!("#{}", idx + 1),
                        code: code.to_string(),
                        message,
                    });
                }
            }
        }

        conn.close().await;
        Ok(report)
    }
}

/// Per-command rejection from the device
struct DeviceTrap {
    message: String,
}

/// Minimal RouterOS API connection: length-prefixed words grouped into
/// sentences, each ended by a zero-length word.
struct ApiConnection {
    stream: TcpStream,
    timeout: Duration,
}

impl ApiConnection {
    async fn connect(node: &DeviceNode, timeout: Duration) -> Result<Self> {
        let addr = format!("{}:{}", node.host, node.port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                Error::device(codes::DEVICE_TIMEOUT, format!("connect to {} timed out", addr))
            })?
            .map_err(|e| Error::device(normalize_io_error(&e), format!("connect {}: {}", addr, e)))?;
        debug!(%addr, "device connected");
        Ok(Self { stream, timeout })
    }

    async fn login(&mut self, user: &str, pass: &str) -> Result<()> {
        let words = vec![
            "/login".to_string(),
            format!("=name={}", user),
            format!("=password={}", pass),
        ];
        self.write_sentence(&words).await?;
        match self.read_reply().await? {
            Reply::Done => Ok(()),
            Reply::Trap { message } => Err(Error::device(
                normalize_device_code(None, &message),
                format!("login rejected: {}", message),
            )),
        }
    }

    /// Run one command line. Per-command `!trap` rejections come back as
    /// `DeviceTrap`; transport failures abort the whole batch.
    async fn command(&mut self, line: &str) -> std::result::Result<(), DeviceTrap> {
        let words = sentence_words(line);
        if let Err(e) = self.write_sentence(&words).await {
            return Err(DeviceTrap {
                message: e.to_string(),
            });
        }
        match self.read_reply().await {
            Ok(Reply::Done) => Ok(()),
            Ok(Reply::Trap { message }) => Err(DeviceTrap { message }),
            Err(e) => Err(DeviceTrap {
                message: e.to_string(),
            }),
        }
    }

    async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }

    async fn write_sentence(&mut self, words: &[String]) -> Result<()> {
        let mut buf = Vec::new();
        for word in words {
            buf.extend_from_slice(&encode_length(word.len()));
            buf.extend_from_slice(word.as_bytes());
        }
        buf.push(0);
        tokio::time::timeout(self.timeout, self.stream.write_all(&buf))
            .await
            .map_err(|_| Error::device(codes::DEVICE_TIMEOUT, "write timed out"))?
            .map_err(|e| Error::device(normalize_io_error(&e), e.to_string()))?;
        Ok(())
    }

    /// Read sentences until the command finishes with `!done` or `!trap`.
    /// Data sentences (`!re`) are drained and ignored.
    async fn read_reply(&mut self) -> Result<Reply> {
        loop {
            let sentence = self.read_sentence().await?;
            let Some(first) = sentence.first() else {
                continue;
            };
            match first.as_str() {
                "!done" => return Ok(Reply::Done),
                "!trap" | "!fatal" => {
                    let message = sentence
                        .iter()
                        .find_map(|w| w.strip_prefix("=message="))
                        .unwrap_or("device rejected command")
                        .to_string();
                    return Ok(Reply::Trap { message });
                }
                "!re" => continue,
                other => {
                    return Err(Error::device(
                        codes::DEVICE_PROTOCOL_ERROR,
                        format!("unexpected reply word: {}", other),
                    ))
                }
            }
        }
    }

    async fn read_sentence(&mut self) -> Result<Vec<String>> {
        let mut words = Vec::new();
        loop {
            let len = self.read_length().await?;
            if len == 0 {
                return Ok(words);
            }
            let mut buf = vec![0u8; len];
            self.read_exact(&mut buf).await?;
            let word = String::from_utf8(buf).map_err(|_| {
                Error::device(codes::DEVICE_PROTOCOL_ERROR, "non-utf8 word in reply")
            })?;
            words.push(word);
        }
    }

    async fn read_length(&mut self) -> Result<usize> {
        let mut first = [0u8; 1];
        self.read_exact(&mut first).await?;
        let b0 = first[0] as usize;
        let (extra, base) = match b0 {
            0x00..=0x7F => return Ok(b0),
            0x80..=0xBF => (1, b0 & 0x3F),
            0xC0..=0xDF => (2, b0 & 0x1F),
            0xE0..=0xEF => (3, b0 & 0x0F),
            _ => (4, 0),
        };
        let mut len = base;
        let mut rest = vec![0u8; extra];
        self.read_exact(&mut rest).await?;
        for byte in rest {
            len = (len << 8) | byte as usize;
        }
        Ok(len)
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        tokio::time::timeout(self.timeout, self.stream.read_exact(buf))
            .await
            .map_err(|_| Error::device(codes::DEVICE_TIMEOUT, "read timed out"))?
            .map_err(|e| Error::device(normalize_io_error(&e), e.to_string()))?;
        Ok(())
    }
}

enum Reply {
    Done,
    Trap { message: String },
}

/// Encode a word length in the RouterOS variable-width form
fn encode_length(len: usize) -> Vec<u8> {
    match len {
        0..=0x7F => vec![len as u8],
        0x80..=0x3FFF => vec![(0x80 | (len >> 8)) as u8, (len & 0xFF) as u8],
        0x4000..=0x1F_FFFF => vec![
            (0xC0 | (len >> 16)) as u8,
            ((len >> 8) & 0xFF) as u8,
            (len & 0xFF) as u8,
        ],
        _ => vec![
            (0xE0 | (len >> 24)) as u8,
            ((len >> 16) & 0xFF) as u8,
            ((len >> 8) & 0xFF) as u8,
            (len & 0xFF) as u8,
        ],
    }
}

/// Split a command line into API words: the first token is the command path,
/// every `key=value` token becomes an attribute word.
fn sentence_words(line: &str) -> Vec<String> {
    line.split_whitespace()
        .enumerate()
        .map(|(i, token)| {
            if i == 0 || token.starts_with('=') || token.starts_with('/') || !token.contains('=') {
                token.to_string()
            } else {
                format!("={}", token)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> DeviceNode {
        DeviceNode {
            id: "hs-01".to_string(),
            host: "10.200.1.10".to_string(),
            user: "relay".to_string(),
            pass: "secret".to_string(),
            port: 8728,
            timeout_ms: 8000,
        }
    }

    #[tokio::test]
    async fn test_dry_run_short_circuits() {
        let exec = DryRunExecutor;
        let report = exec
            .run(&node(), &["/ip firewall address-list add".to_string()])
            .await
            .unwrap();
        assert!(report.ok);
        assert!(report.dry_run);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_command_cap_enforced() {
        let exec = DryRunExecutor;
        let commands: Vec<String> = (0..=MAX_COMMANDS).map(|i| format!("/cmd {}", i)).collect();
        let report = exec.run(&node(), &commands).await.unwrap();
        assert!(!report.ok);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].cmd, "VALIDATION");
    }

    #[test]
    fn test_encode_length_widths() {
        assert_eq!(encode_length(0), vec![0]);
        assert_eq!(encode_length(0x7F), vec![0x7F]);
        assert_eq!(encode_length(0x80), vec![0x80, 0x80]);
        assert_eq!(encode_length(0x3FFF), vec![0xBF, 0xFF]);
        assert_eq!(encode_length(0x4000), vec![0xC0, 0x40, 0x00]);
    }

    #[test]
    fn test_sentence_words() {
        let words = sentence_words(
            "/ip hotspot ip-binding add mac-address=AA:BB:CC:DD:EE:FF type=bypassed",
        );
        assert_eq!(words[0], "/ip");
        assert!(words.contains(&"=mac-address=AA:BB:CC:DD:EE:FF".to_string()));
        assert!(words.contains(&"=type=bypassed".to_string()));
        assert!(words.contains(&"hotspot".to_string()));
    }
}
