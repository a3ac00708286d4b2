//! OTA Relay CLI Module
//! Command-line interface for the TCU distributor and the ECU consumer

pub mod formatter;

use clap::{Parser, Subcommand};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser, Debug)]
#[command(name = "ota-cli")]
#[command(version)]
#[command(about = "Over-the-air firmware relay: TCU distributor and ECU consumer", long_about = None)]
pub struct Cli {
    /// Configuration file (created with defaults by `init`)
    #[arg(short, long, global = true, default_value = "config.json")]
    pub config: PathBuf,

    /// Output format for the status stream
    #[arg(short, long, global = true, default_value = "pretty")]
    pub format: OutputFormat,

    /// Diagnostic log filter, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Raw `STATUS:`/`LOG:`/`PROGRESS:` lines
    Lines,
    /// One JSON object per event
    Json,
    /// Coloured human output
    Pretty,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a config file with defaults and create the folders
    Init {
        /// Reset the installed version to 1.0
        #[arg(long)]
        reset_version: bool,
    },

    /// Run the TCU distributor, reading commands from stdin
    Tcu {
        /// Also check for updates every poll interval
        #[arg(long)]
        auto: bool,
    },

    /// Run the ECU consumer watch loop
    Ecu,

    /// Run a single update session and exit
    Check,

    /// Enable or disable checksum verification
    Security {
        #[arg(value_enum)]
        state: Toggle,
    },

    /// Show installed version, security posture, sources and folders
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    pub fn enabled(self) -> bool {
        self == Toggle::On
    }
}

/// A line read by the `tcu` command loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCommand {
    Check,
    Security(bool),
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown command '{}' (expected CHECK, SECURITY ON, SECURITY OFF or STATUS)",
            self.0
        )
    }
}

impl std::error::Error for UnknownCommand {}

impl FromStr for TriggerCommand {
    type Err = UnknownCommand;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<String> = line
            .split_whitespace()
            .map(|w| w.to_ascii_uppercase())
            .collect();
        let words: Vec<&str> = words.iter().map(String::as_str).collect();

        match words.as_slice() {
            ["CHECK"] => Ok(TriggerCommand::Check),
            ["STATUS"] => Ok(TriggerCommand::Status),
            ["SECURITY", "ON"] => Ok(TriggerCommand::Security(true)),
            ["SECURITY", "OFF"] => Ok(TriggerCommand::Security(false)),
            _ => Err(UnknownCommand(line.trim().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trigger_commands() {
        assert_eq!("CHECK".parse(), Ok(TriggerCommand::Check));
        assert_eq!("  check \n".parse(), Ok(TriggerCommand::Check));
        assert_eq!("SECURITY OFF".parse(), Ok(TriggerCommand::Security(false)));
        assert_eq!("security   on".parse(), Ok(TriggerCommand::Security(true)));
        assert_eq!("STATUS".parse(), Ok(TriggerCommand::Status));
    }

    #[test]
    fn test_reject_unknown_commands() {
        assert!("".parse::<TriggerCommand>().is_err());
        assert!("SECURITY".parse::<TriggerCommand>().is_err());
        assert_eq!(
            "CHECK NOW".parse::<TriggerCommand>(),
            Err(UnknownCommand("CHECK NOW".to_string()))
        );
    }

    #[test]
    fn test_cli_parses_global_flags() {
        let cli = Cli::parse_from(["ota-cli", "security", "off", "--config", "car/config.json", "-f", "json"]);
        assert_eq!(cli.config, PathBuf::from("car/config.json"));
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Security { state: Toggle::Off }));
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["ota-cli", "tcu", "--auto"]);
        assert_eq!(cli.config, PathBuf::from("config.json"));
        assert_eq!(cli.format, OutputFormat::Pretty);
        assert!(matches!(cli.command, Commands::Tcu { auto: true }));
    }
}
