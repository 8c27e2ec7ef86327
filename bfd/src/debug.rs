//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::{debug, debug_span};

use crate::packet::State;
use crate::session::SessionKey;

// BFD debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    SessionCreate(&'a SessionKey),
    SessionDelete(&'a SessionKey),
    SessionLabelAssign(&'a SessionKey, &'a str),
    SessionLabelClear(&'a SessionKey, &'a str),
    SessionRefcount(&'a SessionKey, u32),
    FsmTransition(&'a SessionKey, State, State),
    PollSequenceStart(&'a SessionKey),
    PollSequenceEnd(&'a SessionKey),
    DetectionTimeExpiry(&'a SessionKey),
    EchoTimeExpiry(&'a SessionKey),
}

// ===== impl Debug =====

impl<'a> Debug<'a> {
    // Returns the string representation of the debug message's level.
    pub(crate) fn level(&self) -> tracing::Level {
        match self {
            Debug::SessionCreate(..)
            | Debug::SessionDelete(..)
            | Debug::SessionLabelAssign(..)
            | Debug::SessionLabelClear(..)
            | Debug::SessionRefcount(..)
            | Debug::FsmTransition(..)
            | Debug::PollSequenceStart(..)
            | Debug::PollSequenceEnd(..)
            | Debug::DetectionTimeExpiry(..)
            | Debug::EchoTimeExpiry(..) => tracing::Level::DEBUG,
        }
    }

    // Logs the debug message.
    pub(crate) fn log(&self) {
        match self {
            Debug::SessionCreate(key) => {
                let _span = debug_span!("session", %key).entered();
                debug!("session created");
            }
            Debug::SessionDelete(key) => {
                let _span = debug_span!("session", %key).entered();
                debug!("session deleted");
            }
            Debug::SessionLabelAssign(key, label) => {
                let _span = debug_span!("session", %key).entered();
                debug!(%label, "label assigned");
            }
            Debug::SessionLabelClear(key, label) => {
                let _span = debug_span!("session", %key).entered();
                debug!(%label, "label cleared");
            }
            Debug::SessionRefcount(key, refcount) => {
                let _span = debug_span!("session", %key).entered();
                debug!(%refcount, "refcount updated");
            }
            Debug::FsmTransition(key, old_state, new_state) => {
                let _span = debug_span!("session", %key).entered();
                debug!(%old_state, %new_state, "state transition");
            }
            Debug::PollSequenceStart(key) => {
                let _span = debug_span!("session", %key).entered();
                debug!("poll sequence started");
            }
            Debug::PollSequenceEnd(key) => {
                let _span = debug_span!("session", %key).entered();
                debug!("poll sequence ended");
            }
            Debug::DetectionTimeExpiry(key) => {
                let _span = debug_span!("session", %key).entered();
                debug!("detection time expired");
            }
            Debug::EchoTimeExpiry(key) => {
                let _span = debug_span!("session", %key).entered();
                debug!("echo detection time expired");
            }
        }
    }
}

impl<'a> std::fmt::Display for Debug<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::SessionCreate(key) => {
                write!(f, "session created: {key}")
            }
            Debug::SessionDelete(key) => {
                write!(f, "session deleted: {key}")
            }
            Debug::SessionLabelAssign(key, label) => {
                write!(f, "label '{label}' assigned to session {key}")
            }
            Debug::SessionLabelClear(key, label) => {
                write!(f, "label '{label}' cleared from session {key}")
            }
            Debug::SessionRefcount(key, refcount) => {
                write!(f, "session {key} refcount is now {refcount}")
            }
            Debug::FsmTransition(key, old_state, new_state) => {
                write!(f, "session {key} state transition: {old_state} -> {new_state}")
            }
            Debug::PollSequenceStart(key) => {
                write!(f, "session {key} poll sequence started")
            }
            Debug::PollSequenceEnd(key) => {
                write!(f, "session {key} poll sequence ended")
            }
            Debug::DetectionTimeExpiry(key) => {
                write!(f, "session {key} detection time expired")
            }
            Debug::EchoTimeExpiry(key) => {
                write!(f, "session {key} echo detection time expired")
            }
        }
    }
}
