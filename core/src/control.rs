//! Control-channel probe.
//!
//! Speaks the small subset of the daemon's line-based control protocol needed
//! to read bootstrap progress: cookie authentication followed by
//! `GETINFO status/bootstrap-phase`.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SupervisorError};
use crate::health::Evidence;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(300);
const IO_TIMEOUT: Duration = Duration::from_millis(500);

/// Where and how to reach the daemon's control port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEndpoint {
    pub addr: SocketAddr,
    /// Cookie file written by the daemon; `None` means no authentication.
    pub cookie_path: Option<PathBuf>,
}

impl ControlEndpoint {
    pub fn local(port: u16, cookie_path: Option<PathBuf>) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            cookie_path,
        }
    }
}

/// Ask the daemon for its bootstrap phase. Any failure to connect,
/// authenticate or get an answer is `ProbeUnreachable`.
pub fn probe(endpoint: &ControlEndpoint) -> Result<Option<Evidence>> {
    query_bootstrap(endpoint).map_err(|source| SupervisorError::ProbeUnreachable {
        addr: endpoint.addr,
        source,
    })
}

fn query_bootstrap(endpoint: &ControlEndpoint) -> io::Result<Option<Evidence>> {
    let stream = TcpStream::connect_timeout(&endpoint.addr, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    let authenticate = match &endpoint.cookie_path {
        Some(path) => format!("AUTHENTICATE {}\r\n", hex(&fs::read(path)?)),
        None => "AUTHENTICATE\r\n".to_string(),
    };
    writer.write_all(authenticate.as_bytes())?;
    expect_ok(&read_reply(&mut reader)?)?;

    writer.write_all(b"GETINFO status/bootstrap-phase\r\n")?;
    let reply = read_reply(&mut reader)?;
    expect_ok(&reply)?;
    let _ = writer.write_all(b"QUIT\r\n");

    Ok(reply.iter().find_map(|line| parse_bootstrap_phase(line)))
}

/// Read one reply: lines up to and including the `NNN ` terminator line.
fn read_reply(reader: &mut impl BufRead) -> io::Result<Vec<String>> {
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control connection closed",
            ));
        }
        let line = line.trim_end().to_string();
        let done = line.len() >= 4 && line.as_bytes()[3] == b' ';
        lines.push(line);
        if done {
            return Ok(lines);
        }
    }
}

fn expect_ok(reply: &[String]) -> io::Result<()> {
    match reply.last() {
        Some(last) if last.starts_with("250") => Ok(()),
        Some(last) => Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("control port refused: {last}"),
        )),
        None => Err(io::Error::new(io::ErrorKind::InvalidData, "empty reply")),
    }
}

/// Parse a `status/bootstrap-phase` reply line, e.g.
/// `250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=45 TAG=loading_descriptors SUMMARY="Loading relay descriptors"`.
pub fn parse_bootstrap_phase(line: &str) -> Option<Evidence> {
    let (_, value) = line.split_once("status/bootstrap-phase=")?;
    let progress = keyword(value, "PROGRESS")?.parse::<u8>().ok()?.min(100);
    let tag = keyword(value, "TAG");
    if progress == 100 || tag.as_deref() == Some("done") {
        return Some(Evidence::Established);
    }
    Some(Evidence::Progress {
        percent: progress,
        summary: keyword(value, "SUMMARY"),
    })
}

/// Value of `KEY=value` or `KEY="quoted value"` within a status line.
fn keyword(text: &str, key: &str) -> Option<String> {
    let needle = format!("{key}=");
    let start = text
        .match_indices(&needle)
        .find(|(i, _)| *i == 0 || text.as_bytes()[i - 1] == b' ')
        .map(|(i, _)| i + needle.len())?;
    let rest = &text[start..];
    if let Some(quoted) = rest.strip_prefix('"') {
        let end = quoted.find('"').unwrap_or(quoted.len());
        Some(quoted[..end].to_string())
    } else {
        Some(rest.split_whitespace().next().unwrap_or_default().to_string())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}
