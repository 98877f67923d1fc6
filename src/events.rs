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

//! Typed asynchronous events and the listener registry that dispatches them.

use crate::grammar;
use crate::reply::Reply;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

const LOG_TARGET: &str = "tor_control::events";

/// One parsed 650 event. Unknown event types are dropped before construction
/// (see [`Event::from_reply`]); unknown keywords within a known event type are
/// stashed in `extra`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Bandwidth { read: String, written: String, extra: KwMap },
    Circuit { id: String, status: String, path: Option<String>, extra: KwMap },
    Stream { id: String, status: String, circ_id: String, target: String, extra: KwMap },
    AddrMap { hostname: String, destination: String, expiry: String, extra: KwMap },
    HsDesc { action: String, address: String, authentication: String, directory: String, descriptor_id: Option<String>, extra: KwMap },
    StreamBandwidth { id: String, written: String, read: String, time: String, extra: KwMap },
    NetworkLiveness { status: String, extra: KwMap },
    Guard { guard_type: String, endpoint: String, status: String, extra: KwMap },
    Signal { signal: String, extra: KwMap },
    OrConn { endpoint: String, status: String, extra: KwMap },
    CircMinor { id: String, event: String, path: Option<String>, extra: KwMap },
    StatusGeneral { runlevel: String, action: String, extra: KwMap },
    StatusClient { runlevel: String, action: String, extra: KwMap },
    StatusServer { runlevel: String, action: String, extra: KwMap },
    HsDescContent { address: String, descriptor_id: String, directory: String, extra: KwMap },
    TransportLaunched { transport_type: String, name: String, address: String, port: String, extra: KwMap },
}

type KwMap = HashMap<String, String>;

impl Event {
    /// The wire tag this event type registers for `SETEVENTS`.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Bandwidth { .. } => "BW",
            Event::Circuit { .. } => "CIRC",
            Event::Stream { .. } => "STREAM",
            Event::AddrMap { .. } => "ADDRMAP",
            Event::HsDesc { .. } => "HS_DESC",
            Event::StreamBandwidth { .. } => "STREAM_BW",
            Event::NetworkLiveness { .. } => "NETWORK_LIVENESS",
            Event::Guard { .. } => "GUARD",
            Event::Signal { .. } => "SIGNAL",
            Event::OrConn { .. } => "ORCONN",
            Event::CircMinor { .. } => "CIRC_MINOR",
            Event::StatusGeneral { .. } => "STATUS_GENERAL",
            Event::StatusClient { .. } => "STATUS_CLIENT",
            Event::StatusServer { .. } => "STATUS_SERVER",
            Event::HsDescContent { .. } => "HS_DESC_CONTENT",
            Event::TransportLaunched { .. } => "TRANSPORT_LAUNCHED",
        }
    }

    /// Parse a 650 reply into a typed event. Returns `Ok(None)` for
    /// unrecognized event tags, which must be dropped silently.
    pub fn from_reply(reply: &Reply) -> Result<Option<Event>, crate::error::TorError> {
        let parsed = grammar::parse(&reply.joined())?;
        let mut args = parsed.args.into_iter();
        let tag = match args.next() {
            Some(tag) => tag,
            None => return Ok(None),
        };
        let rest: Vec<String> = args.collect();
        let extra = parsed.kwargs;

        macro_rules! need {
            ($idx:expr, $name:expr) => {
                rest.get($idx)
                    .cloned()
                    .ok_or_else(|| crate::error::TorError::ProtocolError(format!("{} event missing {}", tag, $name)))?
            };
        }

        let event = match tag.as_str() {
            "BW" => Event::Bandwidth { read: need!(0, "read"), written: need!(1, "written"), extra },
            "CIRC" => Event::Circuit { id: need!(0, "id"), status: need!(1, "status"), path: rest.get(2).cloned(), extra },
            "STREAM" => Event::Stream {
                id: need!(0, "id"),
                status: need!(1, "status"),
                circ_id: need!(2, "circ_id"),
                target: need!(3, "target"),
                extra,
            },
            "ADDRMAP" => Event::AddrMap {
                hostname: need!(0, "hostname"),
                destination: need!(1, "destination"),
                expiry: need!(2, "expiry"),
                extra,
            },
            "HS_DESC" => Event::HsDesc {
                action: need!(0, "action"),
                address: need!(1, "address"),
                authentication: need!(2, "authentication"),
                directory: need!(3, "directory"),
                descriptor_id: rest.get(4).cloned(),
                extra,
            },
            "STREAM_BW" => Event::StreamBandwidth {
                id: need!(0, "id"),
                written: need!(1, "written"),
                read: need!(2, "read"),
                time: need!(3, "time"),
                extra,
            },
            "NETWORK_LIVENESS" => Event::NetworkLiveness { status: need!(0, "status"), extra },
            "GUARD" => Event::Guard {
                guard_type: need!(0, "guard_type"),
                endpoint: need!(1, "endpoint"),
                status: need!(2, "status"),
                extra,
            },
            "SIGNAL" => Event::Signal { signal: need!(0, "signal"), extra },
            "ORCONN" => Event::OrConn { endpoint: need!(0, "endpoint"), status: need!(1, "status"), extra },
            "CIRC_MINOR" => Event::CircMinor {
                id: need!(0, "id"),
                event: need!(1, "event"),
                path: rest.get(2).cloned(),
                extra,
            },
            "STATUS_GENERAL" => Event::StatusGeneral { runlevel: need!(0, "runlevel"), action: need!(1, "action"), extra },
            "STATUS_CLIENT" => Event::StatusClient { runlevel: need!(0, "runlevel"), action: need!(1, "action"), extra },
            "STATUS_SERVER" => Event::StatusServer { runlevel: need!(0, "runlevel"), action: need!(1, "action"), extra },
            "HS_DESC_CONTENT" => Event::HsDescContent {
                address: need!(0, "address"),
                descriptor_id: need!(1, "descriptor_id"),
                directory: need!(2, "directory"),
                extra,
            },
            "TRANSPORT_LAUNCHED" => Event::TransportLaunched {
                transport_type: need!(0, "transport_type"),
                name: need!(1, "name"),
                address: need!(2, "address"),
                port: need!(3, "port"),
                extra,
            },
            _ => {
                log::debug!(target: LOG_TARGET, "dropping unrecognized event type {}", tag);
                return Ok(None);
            },
        };
        Ok(Some(event))
    }
}

/// A subscribed callback, invoked sequentially per event type in arrival order.
pub type Listener = Box<dyn Fn(&Event) -> Result<(), String> + Send + Sync>;

/// Anything capable of sending a raw command and checking its status, so the
/// bus can issue `SETEVENTS` without depending on the full `Session` type.
#[async_trait::async_trait]
pub trait CommandSink: Send + Sync {
    async fn command(&self, line: String) -> Result<Reply, crate::error::TorError>;
}

/// Listener registry plus the server-side `SETEVENTS` registration it mirrors.
pub struct EventBus<S: CommandSink> {
    sink: Arc<S>,
    listeners: Mutex<HashMap<&'static str, Vec<Listener>>>,
    registered: Mutex<Vec<&'static str>>,
}

const ALL_KINDS: &[&str] = &[
    "BW", "CIRC", "STREAM", "ADDRMAP", "HS_DESC", "STREAM_BW", "NETWORK_LIVENESS", "GUARD", "SIGNAL", "ORCONN",
    "CIRC_MINOR", "STATUS_GENERAL", "STATUS_CLIENT", "STATUS_SERVER", "HS_DESC_CONTENT", "TRANSPORT_LAUNCHED",
];

impl<S: CommandSink> EventBus<S> {
    pub fn new(sink: Arc<S>) -> Self {
        Self {
            sink,
            listeners: Mutex::new(HashMap::new()),
            registered: Mutex::new(Vec::new()),
        }
    }

    fn kind_name(kind: &str) -> Result<&'static str, crate::error::TorError> {
        ALL_KINDS
            .iter()
            .find(|k| **k == kind)
            .copied()
            .ok_or_else(|| crate::error::TorError::ProtocolError(format!("unknown event kind {}", kind)))
    }

    /// Register `listener` for `kind`, issuing `SETEVENTS` if this is the
    /// first listener for that type.
    pub async fn subscribe(&self, kind: &str, listener: Listener) -> Result<(), crate::error::TorError> {
        let kind = Self::kind_name(kind)?;
        let mut listeners = self.listeners.lock().await;
        listeners.entry(kind).or_default().push(listener);
        drop(listeners);
        self.sync_registration().await
    }

    /// Drop all listeners for `kind`, issuing `SETEVENTS` if that empties it.
    pub async fn unsubscribe_all(&self, kind: &str) -> Result<(), crate::error::TorError> {
        let kind = Self::kind_name(kind)?;
        let mut listeners = self.listeners.lock().await;
        listeners.remove(kind);
        drop(listeners);
        self.sync_registration().await
    }

    async fn sync_registration(&self) -> Result<(), crate::error::TorError> {
        let live: Vec<&'static str> = {
            let listeners = self.listeners.lock().await;
            ALL_KINDS.iter().copied().filter(|k| listeners.get(k).is_some_and(|v| !v.is_empty())).collect()
        };
        let mut registered = self.registered.lock().await;
        if *registered == live {
            return Ok(());
        }
        let command = format!("SETEVENTS {}", live.join(" "));
        let reply = self.sink.command(command).await?;
        if !reply.is_ok() {
            return Err(crate::error::TorError::CommandFailed {
                command: "SETEVENTS".to_string(),
                status: reply.status,
                reply: reply.joined(),
            });
        }
        *registered = live;
        Ok(())
    }

    /// Dispatch one incoming 650 reply: parse it, drop unknown types, and run
    /// every listener registered for its kind in order. A listener error is
    /// logged and does not stop the remaining listeners from running.
    pub async fn dispatch(&self, reply: &Reply) -> Result<(), crate::error::TorError> {
        let event = match Event::from_reply(reply)? {
            Some(event) => event,
            None => return Ok(()),
        };
        let listeners = self.listeners.lock().await;
        if let Some(callbacks) = listeners.get(event.kind()) {
            for listener in callbacks {
                if let Err(err) = listener(&event) {
                    log::error!(target: LOG_TARGET, "event listener for {} failed: {}", event.kind(), err);
                }
            }
        }
        Ok(())
    }

    /// Run the dispatch loop until the event channel closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<Reply>) {
        while let Some(reply) = events.recv().await {
            if let Err(err) = self.dispatch(&reply).await {
                log::error!(target: LOG_TARGET, "failed to dispatch event: {}", err);
            }
        }
    }
}
