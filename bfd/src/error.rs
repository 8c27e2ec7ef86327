//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use tracing::warn;

use crate::packet::DecodeError;
use crate::session::SessionKey;

// BFD errors.
#[derive(Debug)]
pub enum Error {
    // I/O errors.
    IoError(IoError),
    // A received packet couldn't be decoded.
    UdpPacketDecodeError(DecodeError),
    // A received packet's source address doesn't correspond to a real
    // interface address.
    UdpInvalidSourceAddr(IpAddr),
    // A received packet doesn't match any known session.
    SessionNoMatch(IpAddr, Option<u32>),
    // A received packet's version doesn't match ours.
    VersionMismatch(u8),
    // The peer specified a discriminator that no session is using.
    InvalidYourDiscriminator(u32),
    // Attempted operation on a session key that doesn't exist.
    LookupMiss(SessionKey),
    // Attempted to create a session that already exists.
    Exists(SessionKey),
    // Discriminator space is exhausted.
    ResourceExhausted,
    // The requested configuration is invalid (e.g. conflicting label).
    InvalidConfig(String),
    // Attempted to delete a session that's still in use.
    RefcountBusy(SessionKey, u32),
}

// BFD I/O errors.
#[derive(Debug)]
pub enum IoError {
    SocketError(std::io::Error),
    RecvError(std::io::Error),
    RecvMissingSourceAddr,
    RecvMissingAncillaryData,
    SendError(std::io::Error),
}

// ===== impl Error =====

impl Error {
    // Logs the error using the tracing facade.
    pub fn log(&self) {
        match self {
            Error::IoError(error) => {
                error.log();
            }
            Error::UdpPacketDecodeError(error) => {
                warn!(%error, "failed to decode BFD packet");
            }
            Error::UdpInvalidSourceAddr(addr) => {
                warn!(%addr, "invalid source address in received packet");
            }
            Error::SessionNoMatch(addr, discr) => {
                warn!(%addr, ?discr, "received packet doesn't match any session");
            }
            Error::VersionMismatch(version) => {
                warn!(%version, "version mismatch in received packet");
            }
            Error::InvalidYourDiscriminator(discr) => {
                warn!(%discr, "invalid your-discriminator in received packet");
            }
            Error::LookupMiss(key) => {
                warn!(%key, "session lookup failed");
            }
            Error::Exists(key) => {
                warn!(%key, "session already exists");
            }
            Error::ResourceExhausted => {
                warn!("discriminator space exhausted");
            }
            Error::InvalidConfig(reason) => {
                warn!(%reason, "invalid configuration");
            }
            Error::RefcountBusy(key, refcount) => {
                warn!(%key, %refcount, "session still referenced, refusing to delete");
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(error) => error.fmt(f),
            Error::UdpPacketDecodeError(error) => {
                write!(f, "failed to decode packet: {error}")
            }
            Error::UdpInvalidSourceAddr(addr) => {
                write!(f, "invalid source address: {addr}")
            }
            Error::SessionNoMatch(addr, discr) => {
                write!(f, "no session matches packet from {addr} (discr: {discr:?})")
            }
            Error::VersionMismatch(version) => {
                write!(f, "unsupported BFD version: {version}")
            }
            Error::InvalidYourDiscriminator(discr) => {
                write!(f, "invalid your-discriminator: {discr}")
            }
            Error::LookupMiss(key) => {
                write!(f, "session not found: {key}")
            }
            Error::Exists(key) => {
                write!(f, "session already exists: {key}")
            }
            Error::ResourceExhausted => {
                write!(f, "discriminator space exhausted")
            }
            Error::InvalidConfig(reason) => {
                write!(f, "invalid configuration: {reason}")
            }
            Error::RefcountBusy(key, refcount) => {
                write!(f, "session {key} has {refcount} active client(s)")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(error) => error.source(),
            Error::UdpPacketDecodeError(error) => Some(error),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::IoError(error)
    }
}

impl From<DecodeError> for Error {
    fn from(error: DecodeError) -> Error {
        Error::UdpPacketDecodeError(error)
    }
}

// ===== impl IoError =====

impl IoError {
    pub(crate) fn log(&self) {
        match self {
            IoError::SocketError(error) => {
                warn!(%error, "socket error");
            }
            IoError::RecvError(error) => {
                warn!(%error, "failed to receive packet");
            }
            IoError::RecvMissingSourceAddr => {
                warn!("failed to retrieve source address from received packet");
            }
            IoError::RecvMissingAncillaryData => {
                warn!("failed to retrieve ancillary data from received packet");
            }
            IoError::SendError(error) => {
                warn!(%error, "failed to send packet");
            }
        }
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::SocketError(error) => write!(f, "socket error: {error}"),
            IoError::RecvError(error) => write!(f, "failed to receive packet: {error}"),
            IoError::RecvMissingSourceAddr => {
                write!(f, "failed to retrieve source address from received packet")
            }
            IoError::RecvMissingAncillaryData => {
                write!(f, "failed to retrieve ancillary data from received packet")
            }
            IoError::SendError(error) => write!(f, "failed to send packet: {error}"),
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::SocketError(error)
            | IoError::RecvError(error)
            | IoError::SendError(error) => Some(error),
            IoError::RecvMissingSourceAddr | IoError::RecvMissingAncillaryData => None,
        }
    }
}
