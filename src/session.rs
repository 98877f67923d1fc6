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

//! Serializes outgoing commands and routes incoming replies to either the
//! response channel (synchronous command replies) or the event channel (650s).

use crate::error::TorError;
use crate::events::CommandSink;
use crate::reply::{read_reply, Reply};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

const LOG_TARGET: &str = "tor_control::session";
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// One in-flight control connection. Exactly one reader task runs for the
/// session's lifetime; [`Session::command`] serializes writers behind a mutex
/// so that replies are observed in submission order even though events may be
/// interleaved on the wire between a write and its matching reply.
pub struct Session<W> {
    writer: Mutex<W>,
    responses: Mutex<mpsc::Receiver<Result<Reply, TorError>>>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> Session<W> {
    /// Spawn the reader task over `reader`/`writer` and return the session
    /// plus the event channel the caller should hand to an [`crate::events::EventBus`].
    pub fn spawn<R>(reader: R, writer: W) -> (Self, mpsc::Receiver<Reply>)
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (response_tx, response_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(reader_loop(reader, response_tx, event_tx));

        (
            Session {
                writer: Mutex::new(writer),
                responses: Mutex::new(response_rx),
            },
            event_rx,
        )
    }

    /// Send one command line (without the `\r\n` terminator) and await its
    /// reply. Holds the command mutex across the write and the matching read,
    /// so a cancelled future still leaves the slot held until the reply that
    /// was already in flight is drained — Tor has no command-cancellation
    /// protocol, so the alternative is permanently desynchronizing replies.
    pub async fn command(&self, line: impl Into<String>) -> Result<Reply, TorError> {
        let line = line.into();
        let mut writer = self.writer.lock().await;
        log::debug!(target: LOG_TARGET, "> {}", line);
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        writer.flush().await?;

        let mut responses = self.responses.lock().await;
        let reply = responses.recv().await.ok_or(TorError::SessionTerminated)??;
        Ok(reply)
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> CommandSink for Session<W> {
    async fn command(&self, line: String) -> Result<Reply, TorError> {
        Session::command(self, line).await
    }
}

/// Pulls framed replies off the socket for the session's lifetime, routing
/// 650s to the event channel and everything else to the response channel.
async fn reader_loop<R>(
    mut reader: R,
    response_tx: mpsc::Sender<Result<Reply, TorError>>,
    event_tx: mpsc::Sender<Reply>,
) where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_reply(&mut reader).await {
            Ok(reply) if reply.is_event() => {
                if event_tx.send(reply).await.is_err() {
                    log::warn!(target: LOG_TARGET, "event receiver dropped, discarding further events");
                }
            },
            Ok(reply) => {
                if response_tx.send(Ok(reply)).await.is_err() {
                    break;
                }
            },
            Err(err) => {
                log::warn!(target: LOG_TARGET, "session terminating: {}", err);
                let _ = response_tx.send(Err(TorError::SessionTerminated)).await;
                break;
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};

    #[tokio::test]
    async fn command_observes_its_own_reply_in_order() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_reader, client_writer) = tokio::io::split(client);
        let (session, _events) = Session::spawn(BufReader::new(client_reader), client_writer);

        let (mut server_reader, mut server_writer) = tokio::io::split(server);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            loop {
                let n = match server_reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let received = String::from_utf8_lossy(&buf[..n]);
                if received.contains("GETINFO version") {
                    server_writer.write_all(b"250-version=0.4.7.1\r\n250 OK\r\n").await.unwrap();
                }
            }
        });

        let reply = session.command("GETINFO version").await.unwrap();
        assert_eq!(reply.status, 250);
        assert_eq!(reply.lines, vec!["version=0.4.7.1".to_string()]);
    }

    #[tokio::test]
    async fn events_interleaved_between_write_and_reply_are_routed_separately() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_reader, client_writer) = tokio::io::split(client);
        let (session, mut events) = Session::spawn(BufReader::new(client_reader), client_writer);

        let (mut server_reader, mut server_writer) = tokio::io::split(server);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server_reader.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).contains("GETINFO version"));
            server_writer
                .write_all(b"650-BW 1234 5678\r\n650 OK\r\n250 OK\r\n")
                .await
                .unwrap();
        });

        let reply = session.command("GETINFO version").await.unwrap();
        assert_eq!(reply.status, 250);

        let event_reply = events.recv().await.unwrap();
        assert!(event_reply.is_event());
        assert_eq!(event_reply.lines, vec!["BW 1234 5678".to_string()]);
    }
}
