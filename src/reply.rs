// Copyright 2020, The Tari Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Frames the Tor control port's status-prefixed, possibly multi-line replies.

use crate::error::TorError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

const LOG_TARGET: &str = "tor_control::reply";

/// Status 650 marks an asynchronous event rather than a command reply.
pub const EVENT_STATUS: i32 = 650;

/// One complete reply: the status code of its terminating line, and its content
/// lines in arrival order (without their status/separator prefix). A data-block
/// segment is folded into a single `lines` entry containing the raw block text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: i32,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_event(&self) -> bool {
        self.status == EVENT_STATUS
    }

    pub fn is_ok(&self) -> bool {
        self.status == 250
    }

    /// The reply's lines joined by single spaces, ready for `grammar::parse`.
    pub fn joined(&self) -> String {
        self.lines.join(" ")
    }
}

/// Reads one full reply from `reader`, per the control-port framing rules:
/// the 4th byte of each line is `' '` (final), `'-'` (continuation), or `'+'`
/// (data-block introducer terminated by a lone `.` line). A terminal `" OK\r\n"`
/// body is consumed but not recorded. A non-digit status prefix yields `status
/// == -1` and stops the reply there.
pub async fn read_reply<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Reply, TorError> {
    let mut lines = Vec::new();
    loop {
        let line = read_line(reader).await?;
        let status = match parse_status(&line) {
            Some(status) => status,
            None => {
                log::warn!(target: LOG_TARGET, "non-digit status prefix in line {:?}", line);
                return Ok(Reply { status: -1, lines });
            },
        };

        let marker = line.as_bytes().get(3).copied();
        match marker {
            Some(b' ') => {
                let body = &line[4..];
                if body != "OK" {
                    lines.push(body.to_string());
                }
                return Ok(Reply { status, lines });
            },
            Some(b'-') => {
                lines.push(line[4..].to_string());
                continue;
            },
            Some(b'+') => {
                let mut block = line[4..].to_string();
                block.push_str("\r\n");
                loop {
                    let data_line = read_line(reader).await?;
                    if data_line == "." {
                        block.push_str(".\r\n");
                        break;
                    }
                    block.push_str(&data_line);
                    block.push_str("\r\n");
                }
                lines.push(block);
                continue;
            },
            _ => {
                return Err(TorError::ProtocolError(format!("malformed reply line {:?}", line)));
            },
        }
    }
}

/// Reads one `\r\n`-terminated line, stripped of the terminator.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, TorError> {
    let mut buf = String::new();
    let n = reader.read_line(&mut buf).await?;
    if n == 0 {
        return Err(TorError::SessionTerminated);
    }
    while buf.ends_with('\n') || buf.ends_with('\r') {
        buf.pop();
    }
    Ok(buf)
}

fn parse_status(line: &str) -> Option<i32> {
    if line.len() < 4 {
        return None;
    }
    line[..3].parse::<i32>().ok()
}
