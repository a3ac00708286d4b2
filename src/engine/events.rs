//! Status Line Stream
//!
//! The observer contract shared by the distributor and the consumer: a stream
//! of `(kind, payload)` events rendered one per line as
//! `STATUS:<label>:<color>`, `LOG:<message>` or `PROGRESS:<percent>`.

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;

/// Severity colors attached to status labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusColor {
    Gray,
    Blue,
    Amber,
    Purple,
    DeepPurple,
    Green,
    Red,
}

impl StatusColor {
    const ALL: [StatusColor; 7] = [
        StatusColor::Gray,
        StatusColor::Blue,
        StatusColor::Amber,
        StatusColor::Purple,
        StatusColor::DeepPurple,
        StatusColor::Green,
        StatusColor::Red,
    ];

    /// Wire representation
    pub fn code(&self) -> &'static str {
        match self {
            StatusColor::Gray => "gray",
            StatusColor::Blue => "#2196F3",
            StatusColor::Amber => "#ffc107",
            StatusColor::Purple => "#9c27b0",
            StatusColor::DeepPurple => "#673ab7",
            StatusColor::Green => "#4CAF50",
            StatusColor::Red => "#f44336",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.code().eq_ignore_ascii_case(code.trim()))
    }

    /// RGB triple for terminal rendering
    pub fn rgb(&self) -> (u8, u8, u8) {
        match self {
            StatusColor::Gray => (128, 128, 128),
            StatusColor::Blue => (0x21, 0x96, 0xf3),
            StatusColor::Amber => (0xff, 0xc1, 0x07),
            StatusColor::Purple => (0x9c, 0x27, 0xb0),
            StatusColor::DeepPurple => (0x67, 0x3a, 0xb7),
            StatusColor::Green => (0x4c, 0xaf, 0x50),
            StatusColor::Red => (0xf4, 0x43, 0x36),
        }
    }
}

/// One observer-facing event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusEvent {
    Status { label: String, color: StatusColor },
    Log { message: String },
    Progress { percent: f64 },
}

impl StatusEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StatusEvent::Status { .. } => "status",
            StatusEvent::Log { .. } => "log",
            StatusEvent::Progress { .. } => "progress",
        }
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::Status { label, color } => write!(f, "STATUS:{}:{}", label, color.code()),
            StatusEvent::Log { message } => write!(f, "LOG:{}", message),
            StatusEvent::Progress { percent } => write!(f, "PROGRESS:{:.1}", percent),
        }
    }
}

impl FromStr for StatusEvent {
    type Err = Infallible;

    /// Lines that do not follow the protocol are kept verbatim as log messages.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let raw = || StatusEvent::Log {
            message: line.to_string(),
        };

        let Some((kind, content)) = line.split_once(':') else {
            return Ok(raw());
        };

        let event = match kind.trim().to_ascii_lowercase().as_str() {
            "status" => match content.split_once(':') {
                Some((label, code)) => StatusEvent::Status {
                    label: label.trim().to_string(),
                    color: StatusColor::from_code(code).unwrap_or(StatusColor::Gray),
                },
                None => StatusEvent::Status {
                    label: content.trim().to_string(),
                    color: StatusColor::Gray,
                },
            },
            "log" => StatusEvent::Log {
                message: content.to_string(),
            },
            "progress" => match content.trim().parse::<f64>() {
                Ok(percent) if percent.is_finite() => StatusEvent::Progress {
                    percent: percent.clamp(0.0, 100.0),
                },
                _ => raw(),
            },
            _ => raw(),
        };

        Ok(event)
    }
}

/// Cloneable handle for emitting status events
///
/// Sending never fails the caller: once the observer is gone, events are
/// dropped.
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: Option<mpsc::UnboundedSender<StatusEvent>>,
}

impl Reporter {
    /// Create a reporter and the receiving end of its stream
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A reporter with no observer
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: StatusEvent) {
        tracing::debug!(kind = event.kind(), "{}", event);
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn status(&self, label: &str, color: StatusColor) {
        self.emit(StatusEvent::Status {
            label: label.to_string(),
            color,
        });
    }

    pub fn log(&self, message: impl Into<String>) {
        self.emit(StatusEvent::Log {
            message: message.into(),
        });
    }

    /// Emit progress as a percentage in `[0, 100]`
    pub fn progress(&self, percent: f64) {
        self.emit(StatusEvent::Progress {
            percent: percent.clamp(0.0, 100.0),
        });
    }
}
