//! Per-platform framing the kernel's TUN device wraps around the bare IP
//! packet (§4.1: "packets carry a platform-specific prefix that the adapter
//! strips on read and prepends on write"). Kept as pure, allocation-light
//! functions so they're testable without opening a real device.

/// What the kernel prepends to each packet on this platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingKind {
    /// Bare IP packet, no prefix (Linux IFF_TUN with packet info disabled).
    None,
    /// 4-byte big-endian address-family value (macOS utun: `AF_INET`/`AF_INET6`).
    AddressFamily,
}

const AF_INET: u32 = 2;
const AF_INET6: u32 = 30; // macOS's PF_INET6 value; Linux's AF_INET6 (10) is irrelevant here.

pub fn current() -> FramingKind {
    if cfg!(target_os = "macos") {
        FramingKind::AddressFamily
    } else {
        FramingKind::None
    }
}

/// Strip the platform prefix from a just-read device buffer, returning the
/// bare IP packet slice.
pub fn strip(kind: FramingKind, raw: &[u8]) -> Option<&[u8]> {
    match kind {
        FramingKind::None => Some(raw),
        FramingKind::AddressFamily => raw.get(4..),
    }
}

/// Prepend the platform prefix a device write needs, appending the IP
/// packet bytes to `out` (which the caller clears first).
pub fn prepend(kind: FramingKind, packet: &[u8], out: &mut Vec<u8>) {
    match kind {
        FramingKind::None => out.extend_from_slice(packet),
        FramingKind::AddressFamily => {
            let version = packet.first().map(|b| b >> 4).unwrap_or(4);
            let af: u32 = if version == 6 { AF_INET6 } else { AF_INET };
            out.extend_from_slice(&af.to_be_bytes());
            out.extend_from_slice(packet);
        }
    }
}
