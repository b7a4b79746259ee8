//! The daemon's wire protocol (§6): one fixed-size request struct per request, no framing beyond
//! that, FDs passed out-of-band via `SCM_RIGHTS`. Grounded directly on the packet catalogue in
//! `FEXServerClient.h`'s `PacketType`, scoped to the four request kinds this crate's dispatcher
//! and daemon actually need (kill, log FD, rootfs path, pidfd) — the code-cache population and
//! query packets in the original belong to a disk-cache-priming workflow this crate doesn't have.

/// Every packet begins with one of these as its first four bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum PacketType {
    Kill = 0,
    GetLogFd = 1,
    GetRootfsPath = 2,
    GetPidFd = 3,
    Success = 4,
    Error = 5,
}

impl PacketType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Kill,
            1 => Self::GetLogFd,
            2 => Self::GetRootfsPath,
            3 => Self::GetPidFd,
            4 => Self::Success,
            5 => Self::Error,
            _ => return None,
        })
    }
}

/// The only request shape this protocol has: a bare header naming what's being asked for. None
/// of the four request kinds carry a payload.
pub const REQUEST_SIZE: usize = 4;

pub fn encode_request(kind: PacketType) -> [u8; REQUEST_SIZE] {
    (kind as u32).to_ne_bytes()
}

pub fn decode_request(buf: &[u8]) -> Option<PacketType> {
    if buf.len() < REQUEST_SIZE {
        return None;
    }
    let raw = u32::from_ne_bytes(buf[..4].try_into().unwrap());
    PacketType::from_raw(raw)
}

/// A response header with no attached FD or payload (`GetLogFd`/`GetPidFd` success carries an FD
/// via `SCM_RIGHTS` alongside this; an error response carries nothing else).
pub fn encode_response_header(kind: PacketType) -> [u8; 4] {
    (kind as u32).to_ne_bytes()
}

/// `GetRootfsPath`'s success response: header, then a `u64` length, then the path bytes
/// (NUL-terminated, matching `FEXServerResultPacket::MountPath`).
pub fn encode_rootfs_response(path: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 8 + path.len() + 1);
    out.extend_from_slice(&encode_response_header(PacketType::GetRootfsPath));
    out.extend_from_slice(&((path.len() + 1) as u64).to_ne_bytes());
    out.extend_from_slice(path.as_bytes());
    out.push(0);
    out
}

pub fn decode_rootfs_response(buf: &[u8]) -> Option<String> {
    if buf.len() < 12 {
        return None;
    }
    if PacketType::from_raw(u32::from_ne_bytes(buf[..4].try_into().unwrap())) != Some(PacketType::GetRootfsPath) {
        return None;
    }
    let len = u64::from_ne_bytes(buf[4..12].try_into().unwrap()) as usize;
    let bytes = buf.get(12..12 + len)?;
    let bytes = bytes.strip_suffix(&[0]).unwrap_or(bytes);
    std::str::from_utf8(bytes).ok().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_bare_request() {
        let buf = encode_request(PacketType::GetPidFd);
        assert_eq!(decode_request(&buf), Some(PacketType::GetPidFd));
    }

    #[test]
    fn unknown_packet_kind_decodes_to_none() {
        assert_eq!(PacketType::from_raw(255), None);
    }

    #[test]
    fn round_trips_a_rootfs_response() {
        let buf = encode_rootfs_response("/opt/dbtx/rootfs");
        assert_eq!(decode_rootfs_response(&buf).as_deref(), Some("/opt/dbtx/rootfs"));
    }
}
