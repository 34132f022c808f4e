//! Inline UDP framing.
//!
//! Each datagram queued on a UDP pin is stored in the outbound chain as
//! a fixed header followed by the payload:
//!
//! ```text
//! 0      1      2        4                 20        24        28
//! ┌──────┬──────┬────────┬─────────────────┬─────────┬─────────┐
//! │family│ pad  │port BE │ ip (v4 in first │scope id │ payload │
//! │ 4|6  │      │        │ 4 bytes)        │ u32 LE  │ len LE  │
//! └──────┴──────┴────────┴─────────────────┴─────────┴─────────┘
//! ```
//!
//! The header never leaves the process.

use pinio_core::buffer::CHUNK_SIZE;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

pub const FRAME_HEADER: usize = 28;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Write a header for `len` payload bytes to `to` into `dst`.
///
/// Panics if `dst` is shorter than [`FRAME_HEADER`].
pub fn encode_header(dst: &mut [u8], to: SocketAddr, len: usize) {
    let dst = &mut dst[..FRAME_HEADER];
    dst.fill(0);
    match to {
        SocketAddr::V4(a) => {
            dst[0] = FAMILY_V4;
            dst[4..8].copy_from_slice(&a.ip().octets());
        }
        SocketAddr::V6(a) => {
            dst[0] = FAMILY_V6;
            dst[4..20].copy_from_slice(&a.ip().octets());
            dst[20..24].copy_from_slice(&a.scope_id().to_le_bytes());
        }
    }
    dst[2..4].copy_from_slice(&to.port().to_be_bytes());
    dst[24..28].copy_from_slice(&(len as u32).to_le_bytes());
}

/// Read a header back: destination and payload length.
pub fn decode_header(src: &[u8]) -> Option<(SocketAddr, usize)> {
    let src = src.get(..FRAME_HEADER)?;
    let port = u16::from_be_bytes([src[2], src[3]]);
    let len = u32::from_le_bytes([src[24], src[25], src[26], src[27]]) as usize;
    let addr = match src[0] {
        FAMILY_V4 => {
            let ip = Ipv4Addr::new(src[4], src[5], src[6], src[7]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        }
        FAMILY_V6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&src[4..20]);
            let scope = u32::from_le_bytes([src[20], src[21], src[22], src[23]]);
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, scope))
        }
        _ => return None,
    };
    Some((addr, len))
}

/// Largest UDP payload over IPv4: 65535 minus the IP and UDP headers.
pub const MAX_PAYLOAD_V4: usize = 65_507;
/// Largest UDP payload over IPv6 without jumbograms.
pub const MAX_PAYLOAD_V6: usize = 65_527;

/// Largest payload one queued datagram to `to` may carry: the family's
/// UDP limit, capped so the frame still fits one chunk.
pub fn max_payload(to: &SocketAddr) -> usize {
    let wire = match to {
        SocketAddr::V4(_) => MAX_PAYLOAD_V4,
        SocketAddr::V6(_) => MAX_PAYLOAD_V6,
    };
    wire.min(CHUNK_SIZE - FRAME_HEADER)
}

/// Bytes a datagram of `len` occupies in a chunk.
#[inline]
pub fn frame_len(len: usize) -> usize {
    FRAME_HEADER + len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_header() {
        let mut buf = [0xffu8; 32];
        let to: SocketAddr = "10.1.2.3:5353".parse().unwrap();
        encode_header(&mut buf, to, 1200);
        assert_eq!(buf[0], 4);
        assert_eq!(&buf[2..4], &5353u16.to_be_bytes());
        assert_eq!(decode_header(&buf), Some((to, 1200)));
        // Bytes past the header are untouched.
        assert_eq!(&buf[28..], &[0xff; 4]);
    }

    #[test]
    fn test_v6_header_keeps_scope() {
        let mut buf = [0u8; FRAME_HEADER];
        let to = SocketAddr::V6(SocketAddrV6::new("fe80::1".parse().unwrap(), 9, 0, 3));
        encode_header(&mut buf, to, 0);
        assert_eq!(decode_header(&buf), Some((to, 0)));
    }

    #[test]
    fn test_max_payload_per_family() {
        let v4: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let v6: SocketAddr = "[::1]:9".parse().unwrap();
        assert_eq!(max_payload(&v4), 65_507);
        assert_eq!(max_payload(&v6), CHUNK_SIZE - FRAME_HEADER);
        assert!(frame_len(max_payload(&v6)) <= CHUNK_SIZE);
    }

    #[test]
    fn test_garbage_rejected() {
        assert_eq!(decode_header(&[0u8; FRAME_HEADER]), None);
        assert_eq!(decode_header(&[4u8; 10]), None);
    }
}
