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

//! Tokenizer for one reply's worth of positional/keyword/quoted/data-block text.
//!
//! Mirrors the control-port reply grammar: bare tokens become positional `args`,
//! `KEY=VALUE` bindings become `kwargs`, and `+KEY\r\n...\r\n.\r\n` data blocks bind
//! the enclosed text to `KEY`.

use crate::error::TorError;
use std::collections::HashMap;

/// The result of tokenizing one reply: ordered positional arguments plus a
/// keyword map. Order within `args` is preserved; `kwargs` has no defined order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedReply {
    pub args: Vec<String>,
    pub kwargs: HashMap<String, String>,
}

/// Parse `text` as a reply body (`args`/`kwargs` form).
pub fn parse(text: &str) -> Result<ParsedReply, TorError> {
    Parser::new(text).run(false)
}

/// Parse `text` as a keyword-only reply (the form used for GETINFO bodies), where a
/// trailing bare key with no `=` still yields an empty-string value.
pub fn parse_keywords(text: &str) -> Result<HashMap<String, String>, TorError> {
    Ok(Parser::new(text).run(true)?.kwargs)
}

struct Parser<'a> {
    text: &'a [u8],
    index: usize,
    key: Option<String>,
    value: String,
    args: Vec<String>,
    kwargs: HashMap<String, String>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text: text.as_bytes(),
            index: 0,
            key: None,
            value: String::new(),
            args: Vec::new(),
            kwargs: HashMap::new(),
        }
    }

    fn run(mut self, keyword_only: bool) -> Result<ParsedReply, TorError> {
        while self.index < self.text.len() {
            let c = self.pop()?;
            match c {
                b' ' if !keyword_only => {
                    self.flush();
                    continue;
                },
                b'"' if self.value.is_empty() => {
                    self.parse_quoted()?;
                    self.flush();
                    continue;
                },
                b'=' if self.key.is_none() => {
                    self.key = Some(std::mem::take(&mut self.value));
                    if keyword_only {
                        self.take_keyword_value()?;
                        self.flush();
                    }
                    continue;
                },
                b'+' if self.value.is_empty() => {
                    self.parse_data_block()?;
                    continue;
                },
                _ => {
                    self.value.push(c as char);
                },
            }
        }
        self.flush();
        Ok(ParsedReply {
            args: self.args,
            kwargs: self.kwargs,
        })
    }

    /// Consume up to (and past) the next `\r\n` as the value for `self.key`; if no
    /// `\r\n` remains, the rest of the input becomes the value.
    fn take_remainder_of_line(&mut self) {
        let rest = &self.text[self.index..];
        match find(rest, b"\r\n") {
            Some(pos) => {
                self.value = String::from_utf8_lossy(&rest[..pos]).into_owned();
                self.index += pos + 2;
            },
            None => {
                self.value = String::from_utf8_lossy(rest).into_owned();
                self.index = self.text.len();
            },
        }
    }

    fn parse_data_block(&mut self) -> Result<(), TorError> {
        let rest = &self.text[self.index..];
        let eq_pos = find(rest, b"=\r\n")
            .ok_or_else(|| TorError::ProtocolError("truncated data-block introducer".into()))?;
        let key = String::from_utf8_lossy(&rest[..eq_pos]).into_owned();
        self.index += eq_pos + 3;
        let value = self.read_block_body()?;
        self.kwargs.insert(key, value);
        Ok(())
    }

    /// Consumes the value for a `KEY=` binding in keyword-only mode. The control
    /// port's data-block replies, once stripped of their `+` framing by
    /// [`crate::reply::read_reply`], look exactly like `KEY=\r\n<data>\r\n.\r\n` —
    /// an ordinary `KEY=value` line never contains an embedded `\r\n`, so that is
    /// the sole signal distinguishing a data block from a genuine empty value.
    fn take_keyword_value(&mut self) -> Result<(), TorError> {
        let rest = &self.text[self.index..];
        if rest.len() > 2 && rest.starts_with(b"\r\n") {
            self.index += 2;
            self.value = self.read_block_body()?;
        } else {
            self.take_remainder_of_line();
        }
        Ok(())
    }

    /// Consumes text up to and past the next `.\r\n` terminator, returning what
    /// preceded it.
    fn read_block_body(&mut self) -> Result<String, TorError> {
        let body = &self.text[self.index..];
        let term_pos =
            find(body, b".\r\n").ok_or_else(|| TorError::ProtocolError("truncated data block".into()))?;
        let value = String::from_utf8_lossy(&body[..term_pos]).into_owned();
        self.index += term_pos + 3;
        Ok(value)
    }

    fn parse_quoted(&mut self) -> Result<(), TorError> {
        loop {
            let c = self
                .pop()
                .map_err(|_| TorError::ProtocolError("unterminated quoted string".into()))?;
            match c {
                b'\\' => {
                    let escaped = self
                        .pop()
                        .map_err(|_| TorError::ProtocolError("dangling escape in quoted string".into()))?;
                    self.value.push(escaped as char);
                },
                b'"' => return Ok(()),
                _ => self.value.push(c as char),
            }
        }
    }

    fn flush(&mut self) {
        match self.key.take() {
            Some(key) => {
                self.kwargs.insert(key, std::mem::take(&mut self.value));
            },
            None if !self.value.is_empty() => {
                self.args.push(std::mem::take(&mut self.value));
            },
            None => {},
        }
    }

    fn pop(&mut self) -> Result<u8, TorError> {
        let c = *self
            .text
            .get(self.index)
            .ok_or_else(|| TorError::ProtocolError("unexpected end of reply".into()))?;
        self.index += 1;
        Ok(c)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn auth_methods_line() {
        let parsed = parse("AUTH METHODS=NULL,HASHEDPASSWORD COOKIEFILE=\"/var/run/tor/control.authcookie\"").unwrap();
        assert_eq!(parsed.args, vec!["AUTH".to_string()]);
        assert_eq!(parsed.kwargs.get("METHODS").unwrap(), "NULL,HASHEDPASSWORD");
        assert_eq!(parsed.kwargs.get("COOKIEFILE").unwrap(), "/var/run/tor/control.authcookie");
    }

    #[test]
    fn data_block_as_keyword() {
        let kwargs = parse_keywords("circuit-status=\r\n1 BUILT $abc\r\n.\r\n").unwrap();
        assert_eq!(kwargs.get("circuit-status").unwrap(), "1 BUILT $abc\r\n");
    }

    #[test]
    fn quoted_escape() {
        let parsed = parse("X=\"a\\\"b\"").unwrap();
        assert_eq!(parsed.kwargs.get("X").unwrap(), "a\"b");
    }

    #[test]
    fn empty_value_after_equals() {
        let kwargs = parse_keywords("FOO=\r\n").unwrap();
        assert_eq!(kwargs.get("FOO").unwrap(), "");
    }

    #[test]
    fn duplicate_keys_last_wins() {
        let parsed = parse("A=1 A=2").unwrap();
        assert_eq!(parsed.kwargs.get("A").unwrap(), "2");
    }

    #[test]
    fn positional_order_preserved() {
        let parsed = parse("one two three").unwrap();
        assert_eq!(parsed.args, vec!["one", "two", "three"]);
    }

    #[test]
    fn trailing_key_with_no_value_binds_empty_string() {
        let kwargs = parse_keywords("FOO=").unwrap();
        assert_eq!(kwargs.get("FOO").unwrap(), "");
    }
}
