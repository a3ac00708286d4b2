//! OTA Relay - over-the-air firmware relay between a TCU and an ECU
//!
//! The TCU distributor discovers firmware on update sources, downloads and
//! verifies it, and hands it to the ECU through a folder mailbox. The ECU
//! consumer applies it and acknowledges.

pub mod engine;
