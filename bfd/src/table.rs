//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashMap;
use std::net::IpAddr;

use generational_arena::Arena;

use crate::error::Error;
use crate::packet::State;
use crate::session::{Session, SessionId, SessionKey};

// All active BFD sessions, indexed for the three ways inbound packets and
// control-plane requests address them: by session key, by local
// discriminator and by label.
//
// Sessions own their storage in an arena so that session identity stays
// stable across mutation while still being cheap to look up by any of its
// keys.
#[derive(Default)]
pub struct Sessions {
    arena: Arena<Session>,
    key_index: HashMap<SessionKey, SessionId>,
    discr_index: HashMap<u32, SessionId>,
    label_index: HashMap<String, SessionId>,
}

impl Sessions {
    pub fn new() -> Self {
        Sessions::default()
    }

    pub fn insert(&mut self, mut session: Session) -> SessionId {
        let key = session.key.clone();
        let discr = session.local_discr;
        let label = session.label.clone();

        let id = self.arena.insert_with(|id| {
            session.id = id;
            session
        });

        self.key_index.insert(key, id);
        self.discr_index.insert(discr, id);
        if let Some(label) = label {
            self.label_index.insert(label, id);
        }

        id
    }

    pub fn delete(&mut self, id: SessionId) -> Option<Session> {
        let session = self.arena.remove(id)?;
        self.key_index.remove(&session.key);
        self.discr_index.remove(&session.local_discr);
        if let Some(label) = &session.label {
            self.label_index.remove(label);
        }
        Some(session)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.arena.get(id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.arena.get_mut(id)
    }

    pub fn get_by_key(&self, key: &SessionKey) -> Option<&Session> {
        self.key_index.get(key).and_then(|id| self.arena.get(*id))
    }

    pub fn get_mut_by_key(&mut self, key: &SessionKey) -> Option<&mut Session> {
        let id = *self.key_index.get(key)?;
        self.arena.get_mut(id)
    }

    pub fn id_by_key(&self, key: &SessionKey) -> Option<SessionId> {
        self.key_index.get(key).copied()
    }

    pub fn get_by_discr(&self, discr: u32) -> Option<&Session> {
        self.discr_index
            .get(&discr)
            .and_then(|id| self.arena.get(*id))
    }

    pub fn get_mut_by_discr(&mut self, discr: u32) -> Option<&mut Session> {
        let id = *self.discr_index.get(&discr)?;
        self.arena.get_mut(id)
    }

    pub fn get_by_label(&self, label: &str) -> Option<&Session> {
        self.label_index
            .get(label)
            .and_then(|id| self.arena.get(*id))
    }

    pub fn id_by_label(&self, label: &str) -> Option<SessionId> {
        self.label_index.get(label).copied()
    }

    // Updates the label index after a session's label is changed in place.
    // Per the label semantics: assigning a label already in use by a
    // different session is rejected by the caller before this is invoked.
    pub fn reindex_label(
        &mut self,
        id: SessionId,
        old: Option<String>,
        new: Option<String>,
    ) -> Result<(), Error> {
        if let Some(new) = &new {
            if let Some(existing) = self.label_index.get(new) {
                if *existing != id {
                    return Err(Error::InvalidConfig(format!(
                        "label '{new}' already in use by another session"
                    )));
                }
            }
        }

        if let Some(old) = old {
            self.label_index.remove(&old);
        }
        if let Some(new) = new {
            self.label_index.insert(new, id);
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (SessionId, &Session)> {
        self.arena.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SessionId, &mut Session)> {
        self.arena.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn discr_in_use(&self, discr: u32) -> bool {
        self.discr_index.contains_key(&discr)
    }

    // Looks up a single-hop session, retrying with an empty port name if
    // the fully-specified key misses (port is optional).
    pub fn find_shop(&self, peer: IpAddr, ifname: &str) -> Option<SessionId> {
        let key = SessionKey::new_shop(peer, ifname.to_string());
        self.id_by_key(&key).or_else(|| {
            if ifname.is_empty() {
                None
            } else {
                self.id_by_key(&SessionKey::new_shop(peer, String::new()))
            }
        })
    }

    pub fn find_mhop(&self, peer: IpAddr, local: IpAddr, vrf: &str) -> Option<SessionId> {
        self.id_by_key(&SessionKey::new_mhop(peer, local, vrf.to_string()))
    }

    // The composite rule a received control packet is matched against:
    // a non-zero Your Discriminator wins outright (after confirming the
    // peer address agrees with the session); otherwise a packet
    // reporting Down/AdminDown may still create/attach via the
    // shop/mhop key; any other packet with a zero Your Discriminator
    // matches nothing.
    pub fn find_for_inbound(
        &self,
        your_discr: u32,
        peer_state: State,
        peer: IpAddr,
        key: &SessionKey,
    ) -> Option<SessionId> {
        if your_discr != 0 {
            let id = self.discr_index.get(&your_discr).copied()?;
            let session = self.arena.get(id)?;
            return (session.key.peer() == peer).then_some(id);
        }

        if matches!(peer_state, State::Down | State::AdminDown) {
            return match key {
                SessionKey::Shop { ifname, .. } => self.find_shop(peer, ifname),
                SessionKey::Mhop { local, vrf, .. } => self.find_mhop(peer, *local, vrf),
            };
        }

        None
    }

    // Administrative lookup variant: no packet is involved, so the
    // shop/mhop key is used directly.
    pub fn find_for_admin(&self, key: &SessionKey) -> Option<SessionId> {
        match key {
            SessionKey::Shop { peer, ifname } => self.find_shop(*peer, ifname),
            SessionKey::Mhop { peer, local, vrf } => self.find_mhop(*peer, *local, vrf),
        }
    }

    // Records interface resolution results from `OSIface`. A no-op if the
    // session has since been deleted (the rescan timer races teardown).
    pub fn set_interface_info(&mut self, id: SessionId, ifindex: Option<u32>, local_mac: Option<[u8; 6]>) {
        if let Some(session) = self.arena.get_mut(id) {
            session.ifindex = ifindex;
            session.local_mac = local_mac;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::session::SessionConfig;

    fn make_session(key: SessionKey, local_discr: u32) -> Session {
        Session {
            id: generational_arena::Index::from_raw_parts(0, 0),
            key,
            local_addr: std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            config: SessionConfig::default(),
            state: crate::packet::State::Down,
            local_discr,
            local_diag: crate::packet::DiagnosticCode::Nothing,
            demand_mode: false,
            poll_active: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
            final_pending: false,
            timers: crate::session::SessionTimers {
                desired_min_tx: std::time::Duration::from_millis(300),
                required_min_rx: std::time::Duration::from_millis(300),
                required_min_echo_rx: std::time::Duration::from_millis(50),
                curr_min_tx: std::time::Duration::from_secs(1),
                curr_min_rx: std::time::Duration::from_millis(300),
            },
            remote: None,
            echo_active: false,
            ifindex: None,
            local_mac: None,
            peer_mac: None,
            t_tx: None,
            t_echo_tx: None,
            t_detect: None,
            t_echo_detect: None,
            refcount: 0,
            label: None,
            uptime: None,
            downtime: None,
            last_down_diag: crate::packet::DiagnosticCode::Nothing,
            counters: Default::default(),
            sla: Default::default(),
            last_xmit_tv: None,
        }
    }

    #[test]
    fn shop_lookup_retries_with_empty_port() {
        let mut sessions = Sessions::new();
        let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let key = SessionKey::new_shop(peer, String::new());
        let id = sessions.insert(make_session(key, 1));

        assert_eq!(sessions.find_shop(peer, "eth0"), Some(id));
        assert_eq!(sessions.find_shop(peer, ""), Some(id));
    }

    #[test]
    fn find_for_inbound_matches_your_discriminator_with_peer_check() {
        let mut sessions = Sessions::new();
        let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3));
        let key = SessionKey::new_shop(peer, "eth0".to_string());
        let id = sessions.insert(make_session(key.clone(), 42));

        assert_eq!(
            sessions.find_for_inbound(42, State::Up, peer, &key),
            Some(id)
        );
        assert_eq!(sessions.find_for_inbound(42, State::Up, other, &key), None);
    }

    #[test]
    fn find_for_inbound_falls_back_to_key_when_discr_zero_and_peer_down() {
        let mut sessions = Sessions::new();
        let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let key = SessionKey::new_shop(peer, "eth0".to_string());
        let id = sessions.insert(make_session(key.clone(), 7));

        assert_eq!(
            sessions.find_for_inbound(0, State::Down, peer, &key),
            Some(id)
        );
        assert_eq!(sessions.find_for_inbound(0, State::Up, peer, &key), None);
    }
}
