use std::collections::HashSet;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

mod config;
mod proxy_header;

pub use config::{
    parse_host_port, ConfigError, ProxyConfig, TlsSettings, TlsVersion, DEFAULT_SECURE_COMMANDS,
};
pub use proxy_header::{proxy_header_v1, ProxyHeaderError};

pub const CONTROL_BUFFER_SIZE: usize = 4096;
pub const REDACTED_PARAMETER: &str = "********";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("control line exceeds {limit} bytes")]
pub struct LineTooLong {
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    raw: Bytes,
    name: String,
    parameter: Option<String>,
}

impl CommandLine {
    pub fn parse(raw: impl Into<Bytes>) -> Self {
        let raw = raw.into();
        let text = String::from_utf8_lossy(&raw);
        let trimmed = text.trim_end_matches(['\r', '\n']);
        let (name, parameter) = match trimmed.split_once(' ') {
            Some((name, parameter)) => (name, Some(parameter.to_string())),
            None => (trimmed, None),
        };
        let name = name.to_ascii_uppercase();
        CommandLine {
            raw,
            name,
            parameter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameter(&self) -> Option<&str> {
        self.parameter.as_deref()
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn raw_bytes(&self) -> Bytes {
        self.raw.clone()
    }

    pub fn display_redacted(&self, secure: &SecureCommandSet) -> String {
        if secure.contains(&self.name) {
            format!("{} {}", self.name, REDACTED_PARAMETER)
        } else {
            String::from_utf8_lossy(&self.raw)
                .trim_end_matches(['\r', '\n'])
                .to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureCommandSet {
    names: HashSet<String>,
}

impl SecureCommandSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        SecureCommandSet {
            names: names
                .into_iter()
                .map(|name| name.as_ref().to_ascii_uppercase())
                .collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(&name.to_ascii_uppercase())
    }
}

impl Default for SecureCommandSet {
    fn default() -> Self {
        SecureCommandSet::new(DEFAULT_SECURE_COMMANDS)
    }
}

pub fn reply_severity(line: &[u8]) -> Option<u8> {
    match line.first() {
        Some(byte) if byte.is_ascii_digit() => Some(byte - b'0'),
        _ => None,
    }
}

#[derive(Debug)]
pub struct LineBuffer {
    buffer: BytesMut,
    limit: usize,
}

impl LineBuffer {
    pub fn new(limit: usize) -> Self {
        LineBuffer {
            buffer: BytesMut::new(),
            limit,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<(), LineTooLong> {
        if self.first_line().is_none() && self.buffer.len() + chunk.len() > self.limit {
            return Err(LineTooLong { limit: self.limit });
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    pub fn first_line(&self) -> Option<&[u8]> {
        self.buffer
            .iter()
            .position(|byte| *byte == b'\n')
            .map(|end| &self.buffer[..=end])
    }

    pub fn take_all(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
