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

//! The ephemeral onion-service handle type and the controller's registry of
//! live services. Unifies the `Onion`/`Onions` shapes (see spec §9(iii)).

use std::collections::HashMap;

/// An ephemeral onion service, as tracked by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Onion {
    pub key_type: String,
    pub key: String,
    pub id: Option<String>,
    pub ports: HashMap<u16, String>,
}

impl Onion {
    /// A handle requesting a server-generated "best" key.
    pub fn new() -> Self {
        Self {
            key_type: "NEW".to_string(),
            key: "BEST".to_string(),
            id: None,
            ports: HashMap::new(),
        }
    }

    /// A handle for a caller-supplied ed25519 key, with its id derived locally.
    pub fn from_key(key: &crate::onion::OnionKey) -> Self {
        Self {
            key_type: "ED25519-V3".to_string(),
            key: key.to_tor_format(),
            id: Some(key.onion_id()),
            ports: HashMap::new(),
        }
    }

    pub fn with_port(mut self, virtual_port: u16, target: impl Into<String>) -> Self {
        self.ports.insert(virtual_port, target.into());
        self
    }
}

impl Default for Onion {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of onion handles the controller has added and not yet removed.
#[derive(Default)]
pub struct OnionRegistry {
    by_id: HashMap<String, Onion>,
}

impl OnionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, onion: Onion) {
        if let Some(id) = onion.id.clone() {
            self.by_id.insert(id, onion);
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Onion> {
        self.by_id.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Onion> {
        self.by_id.get(id)
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::onion::OnionKey;

    #[test]
    fn registry_tracks_insert_and_remove() {
        let mut registry = OnionRegistry::new();
        let onion = Onion::from_key(&OnionKey::from_seed([1u8; 32]));
        let id = onion.id.clone().unwrap();

        registry.insert(onion);
        assert!(registry.is_live(&id));

        registry.remove(&id);
        assert!(!registry.is_live(&id));
    }
}
