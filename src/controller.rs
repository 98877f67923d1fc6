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

//! The controller façade: connect, authenticate, and the thin command
//! wrappers (`GETINFO`, `SIGNAL`, `MAPADDRESS`, ephemeral onion CRUD).

use crate::error::TorError;
use crate::events::{Event, EventBus, Listener};
use crate::grammar;
use crate::onions::{Onion, OnionRegistry};
use crate::reply::Reply;
use crate::session::Session;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

const LOG_TARGET: &str = "tor_control::controller";

const SERVER_HASH_KEY: &[u8] = b"Tor safe cookie authentication server-to-controller hash";
const CLIENT_HASH_KEY: &[u8] = b"Tor safe cookie authentication controller-to-server hash";

/// Tor's default control port.
pub const DEFAULT_PORT: u16 = 9051;

#[derive(Debug, Clone, Default)]
struct AuthInfo {
    methods: Vec<String>,
    cookiefile: Option<String>,
}

/// A connected, not-yet-authenticated-or-authenticated control session.
pub struct Controller {
    session: Arc<Session<OwnedWriteHalf>>,
    events: Arc<EventBus<Session<OwnedWriteHalf>>>,
    onions: Mutex<OnionRegistry>,
    auth: AuthInfo,
}

impl Controller {
    /// Open a TCP connection to `host:port`, issue `PROTOCOLINFO 1`, and start
    /// the event dispatch loop. The controller is not yet authenticated.
    pub async fn connect(host: &str, port: u16) -> Result<Self, TorError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|err| TorError::ConnectFailed(err.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        let (session, event_rx) = Session::spawn(BufReader::new(read_half), write_half);
        let session = Arc::new(session);
        let events = Arc::new(EventBus::new(session.clone()));

        tokio::spawn(events.clone().run(event_rx));

        let reply = session.command("PROTOCOLINFO 1").await?;
        if !reply.is_ok() {
            return Err(TorError::ConnectFailed(format!("PROTOCOLINFO failed with status {}", reply.status)));
        }
        let auth = parse_protocolinfo(&reply)?;

        Ok(Controller {
            session,
            events,
            onions: Mutex::new(OnionRegistry::new()),
            auth,
        })
    }

    /// Authenticate using the first applicable method, in the order given by
    /// spec §4.5: `NULL`, then `HASHEDPASSWORD` (only when a password was
    /// supplied — unlike the reference implementation this crate is modeled
    /// on, which always took this branch due to a truthy-string-literal bug),
    /// then `SAFECOOKIE`, then `COOKIE`.
    pub async fn authenticate(&self, password: Option<&str>) -> Result<(), TorError> {
        let methods = &self.auth.methods;
        let reply = if methods.iter().any(|m| m == "NULL") {
            self.session.command("AUTHENTICATE").await?
        } else if methods.iter().any(|m| m == "HASHEDPASSWORD") && password.is_some() {
            let password = password.unwrap();
            let escaped = password.replace('\\', "\\\\").replace('"', "\\\"");
            self.session.command(format!("AUTHENTICATE \"{}\"", escaped)).await?
        } else if methods.iter().any(|m| m == "SAFECOOKIE") && self.auth.cookiefile.is_some() {
            self.authenticate_safecookie().await?
        } else if methods.iter().any(|m| m == "COOKIE") && self.auth.cookiefile.is_some() {
            let cookie = tokio::fs::read(self.auth.cookiefile.as_ref().unwrap())
                .await
                .map_err(|err| TorError::AuthFailed(format!("could not read cookie file: {}", err)))?;
            self.session.command(format!("AUTHENTICATE {}", hex::encode(cookie))).await?
        } else {
            return Err(TorError::AuthUnavailable);
        };

        if !reply.is_ok() {
            return Err(TorError::AuthFailed(format!("status {}: {}", reply.status, reply.joined())));
        }
        Ok(())
    }

    async fn authenticate_safecookie(&self) -> Result<Reply, TorError> {
        let cookiefile = self.auth.cookiefile.as_ref().expect("checked by caller");
        let cookie = tokio::fs::read(cookiefile)
            .await
            .map_err(|err| TorError::AuthFailed(format!("could not read cookie file: {}", err)))?;

        let mut client_nonce = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut client_nonce);

        let challenge = format!("AUTHCHALLENGE SAFECOOKIE {}", hex::encode(client_nonce));
        let reply = self.session.command(challenge).await?;
        if !reply.is_ok() {
            return Err(TorError::AuthFailed(format!("AUTHCHALLENGE failed: {}", reply.joined())));
        }
        let parsed = grammar::parse(&reply.joined())?;
        let server_hash = parsed
            .kwargs
            .get("SERVERHASH")
            .ok_or_else(|| TorError::AuthFailed("missing SERVERHASH".to_string()))?;
        let server_nonce = parsed
            .kwargs
            .get("SERVERNONCE")
            .ok_or_else(|| TorError::AuthFailed("missing SERVERNONCE".to_string()))?;
        let server_hash = hex::decode(server_hash).map_err(|_| TorError::AuthFailed("malformed SERVERHASH".to_string()))?;
        let server_nonce = hex::decode(server_nonce).map_err(|_| TorError::AuthFailed("malformed SERVERNONCE".to_string()))?;

        let mut msg = Vec::with_capacity(cookie.len() + client_nonce.len() + server_nonce.len());
        msg.extend_from_slice(&cookie);
        msg.extend_from_slice(&client_nonce);
        msg.extend_from_slice(&server_nonce);

        let expected_server_hash = hmac_sha256(SERVER_HASH_KEY, &msg);
        if expected_server_hash.ct_eq(&server_hash).unwrap_u8() != 1 {
            log::warn!(target: LOG_TARGET, "SAFECOOKIE server hash mismatch");
            return Err(TorError::AuthFailed("invalid server hash".to_string()));
        }

        let client_proof = hmac_sha256(CLIENT_HASH_KEY, &msg);
        self.session.command(format!("AUTHENTICATE {}", hex::encode(client_proof))).await
    }

    /// `GETINFO <key>`, returning the value bound to `key`.
    pub async fn get_info(&self, key: &str) -> Result<String, TorError> {
        let reply = self.session.command(format!("GETINFO {}", key)).await?;
        if !reply.is_ok() {
            return Err(TorError::CommandFailed {
                command: format!("GETINFO {}", key),
                status: reply.status,
                reply: reply.joined(),
            });
        }
        let kwargs = grammar::parse_keywords(&reply.joined())?;
        kwargs
            .get(key)
            .cloned()
            .ok_or_else(|| TorError::ProtocolError(format!("GETINFO reply missing key {}", key)))
    }

    /// `SIGNAL <name>`.
    pub async fn signal(&self, name: &str) -> Result<(), TorError> {
        let reply = self.session.command(format!("SIGNAL {}", name)).await?;
        require_ok("SIGNAL", &reply)
    }

    /// `MAPADDRESS <src>=<dst>`, returning the raw reply for inspection.
    pub async fn map_address(&self, src: &str, dst: &str) -> Result<Reply, TorError> {
        let reply = self.session.command(format!("MAPADDRESS {}={}", src, dst)).await?;
        require_ok("MAPADDRESS", &reply)?;
        Ok(reply)
    }

    /// Subscribe `listener` to `kind`, issuing `SETEVENTS` if needed.
    pub async fn on(&self, kind: &str, listener: Listener) -> Result<(), TorError> {
        self.events.subscribe(kind, listener).await
    }

    /// Unsubscribe every listener for `kind`.
    pub async fn off(&self, kind: &str) -> Result<(), TorError> {
        self.events.unsubscribe_all(kind).await
    }

    /// `ADD_ONION`. Populates `onion.id` (and, if the server generated the
    /// key, `onion.key_type`/`onion.key`) from the reply, optionally waiting
    /// for the service's `HS_DESC UPLOADED` event before returning, and
    /// registers the handle in the controller's onion registry.
    pub async fn add_onion(&self, onion: &mut Onion, wait: bool) -> Result<(), TorError> {
        let command = build_add_onion_command(onion);

        let mut upload_rx = if wait {
            Some(self.subscribe_hs_desc_upload().await?)
        } else {
            None
        };

        let reply = self.session.command(command).await?;
        require_ok("ADD_ONION", &reply)?;
        let kwargs = grammar::parse_keywords(&reply.joined())?;

        if let Some(id) = kwargs.get("ServiceID") {
            onion.id = Some(id.clone());
        }
        if let Some(private_key) = kwargs.get("PrivateKey") {
            if let Some((key_type, key)) = private_key.split_once(':') {
                onion.key_type = key_type.to_string();
                onion.key = key.to_string();
            }
        }

        if let Some(rx) = upload_rx.take() {
            let expected_id = onion.id.clone();
            rx.await.map_err(|_| TorError::SessionTerminated)?;
            log::debug!(target: LOG_TARGET, "HS_DESC UPLOADED observed for {:?}", expected_id);
        }

        self.onions.lock().await.insert(onion.clone());
        Ok(())
    }

    /// Wait for the next `HS_DESC UPLOADED` event whose address matches this
    /// onion's id, then unsubscribe.
    async fn subscribe_hs_desc_upload(&self) -> Result<tokio::sync::oneshot::Receiver<()>, TorError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        self.events
            .subscribe(
                "HS_DESC",
                Box::new(move |event| {
                    if let Event::HsDesc { action, .. } = event {
                        if action == "UPLOADED" {
                            if let Some(tx) = tx.lock().unwrap().take() {
                                let _ = tx.send(());
                            }
                        }
                    }
                    Ok(())
                }),
            )
            .await?;
        Ok(rx)
    }

    /// `DEL_ONION <id>`, removing the handle from the registry.
    pub async fn del_onion(&self, id: &str) -> Result<(), TorError> {
        let reply = self.session.command(format!("DEL_ONION {}", id)).await?;
        require_ok("DEL_ONION", &reply)?;
        self.onions.lock().await.remove(id);
        Ok(())
    }

    pub async fn is_onion_live(&self, id: &str) -> bool {
        self.onions.lock().await.is_live(id)
    }
}

fn build_add_onion_command(onion: &Onion) -> String {
    let mut command = format!("ADD_ONION {}:{}", onion.key_type, onion.key);
    let mut ports: Vec<_> = onion.ports.iter().collect();
    ports.sort_by_key(|(port, _)| **port);
    for (virtual_port, target) in ports {
        command.push_str(&format!(" Port={},{}", virtual_port, target));
    }
    command
}

fn require_ok(command: &str, reply: &Reply) -> Result<(), TorError> {
    if reply.is_ok() {
        Ok(())
    } else {
        Err(TorError::CommandFailed {
            command: command.to_string(),
            status: reply.status,
            reply: reply.joined(),
        })
    }
}

fn hmac_sha256(key: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().to_vec()
}

/// Parse a `PROTOCOLINFO` reply's `AUTH` line into the advertised methods and
/// cookie file path.
fn parse_protocolinfo(reply: &Reply) -> Result<AuthInfo, TorError> {
    let mut auth = AuthInfo::default();
    for line in &reply.lines {
        let parsed = grammar::parse(line)?;
        if parsed.args.first().map(String::as_str) == Some("AUTH") {
            if let Some(methods) = parsed.kwargs.get("METHODS") {
                auth.methods = methods.split(',').map(str::to_string).collect();
            }
            auth.cookiefile = parsed.kwargs.get("COOKIEFILE").cloned();
        }
    }
    Ok(auth)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn protocolinfo_parses_methods_and_cookiefile() {
        let reply = Reply {
            status: 250,
            lines: vec![
                "PROTOCOLINFO 1".to_string(),
                "AUTH METHODS=NULL,HASHEDPASSWORD,SAFECOOKIE COOKIEFILE=\"/var/run/tor/control.authcookie\""
                    .to_string(),
                "VERSION Tor=\"0.4.7.1\"".to_string(),
            ],
        };
        let auth = parse_protocolinfo(&reply).unwrap();
        assert_eq!(auth.methods, vec!["NULL", "HASHEDPASSWORD", "SAFECOOKIE"]);
        assert_eq!(auth.cookiefile.as_deref(), Some("/var/run/tor/control.authcookie"));
    }

    #[test]
    fn add_onion_command_string_has_sorted_ports() {
        let mut onion = Onion::new();
        onion = onion.with_port(8080, "127.0.0.1:8080").with_port(22, "unix:/var/run/ssh.sock");
        let command = build_add_onion_command(&onion);
        assert_eq!(command, "ADD_ONION NEW:BEST Port=22,unix:/var/run/ssh.sock Port=8080,127.0.0.1:8080");
    }

    #[test]
    fn safecookie_hash_fixture() {
        let cookie: Vec<u8> = (0u8..32u8).collect();
        let client_nonce = [0u8; 32];
        let server_nonce = [0xFFu8; 32];
        let mut msg = Vec::new();
        msg.extend_from_slice(&cookie);
        msg.extend_from_slice(&client_nonce);
        msg.extend_from_slice(&server_nonce);

        let server_hash = hmac_sha256(SERVER_HASH_KEY, &msg);
        let client_hash = hmac_sha256(CLIENT_HASH_KEY, &msg);
        assert_ne!(server_hash, client_hash);

        let mut tampered = server_hash.clone();
        tampered[0] ^= 0xFF;
        assert_eq!(tampered.ct_eq(&server_hash).unwrap_u8(), 0);
    }
}
