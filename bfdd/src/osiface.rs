//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

// Interface resolution: ifindex and local MAC lookups, mirroring
// `ptm_bfd_fetch_ifindex`/`ptm_bfd_fetch_local_mac` in the reference
// implementation. `nix::net::if_::if_nametoindex` is the safe equivalent of
// a raw `SIOCGIFINDEX` ioctl; no example in the retrieval pack performs a
// raw `ioctl(2)` call for interface metadata, so the MAC address is read
// from sysfs instead of `SIOCGIFHWADDR`, which needs an unsafe ioctl and a
// packed `struct ifreq` the corpus has no precedent for.

use std::io;

pub fn ifindex(ifname: &str) -> io::Result<u32> {
    nix::net::if_::if_nametoindex(ifname).map_err(io::Error::from)
}

pub fn local_mac(ifname: &str) -> io::Result<[u8; 6]> {
    let path = format!("/sys/class/net/{ifname}/address");
    let text = std::fs::read_to_string(path)?;
    parse_mac(text.trim()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed MAC address for interface {ifname}"),
        )
    })
}

fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut octets = text.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(octets.next()?, 16).ok()?;
    }
    if octets.next().is_some() {
        return None;
    }
    Some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_colon_separated_mac() {
        assert_eq!(
            parse_mac("02:42:ac:11:00:02"),
            Some([0x02, 0x42, 0xac, 0x11, 0x00, 0x02])
        );
    }

    #[test]
    fn rejects_malformed_mac() {
        assert_eq!(parse_mac("not-a-mac"), None);
        assert_eq!(parse_mac("02:42:ac:11:00"), None);
    }
}
