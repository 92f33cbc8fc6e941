//! IP packet classification

/// Address family of a raw IP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Classify a packet by the version nibble of its first byte
    ///
    /// Returns `None` for empty input or any version other than 4 or 6.
    pub fn classify(packet: &[u8]) -> Option<Self> {
        match packet.first().map(|b| b >> 4) {
            Some(4) => Some(IpFamily::V4),
            Some(6) => Some(IpFamily::V6),
            _ => None,
        }
    }

    /// Protocol number the interface expects alongside the packet
    ///
    /// Apple's utun (and `NEPacketTunnelFlow`) tag every packet with the
    /// address family constant.
    pub fn protocol_number(&self) -> i32 {
        match self {
            IpFamily::V4 => libc::AF_INET,
            IpFamily::V6 => libc::AF_INET6,
        }
    }

    /// The 4-byte utun header carrying the protocol number in network order
    pub fn utun_header(&self) -> [u8; 4] {
        (self.protocol_number() as u32).to_be_bytes()
    }
}

impl std::fmt::Display for IpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "IPv4"),
            IpFamily::V6 => write!(f, "IPv6"),
        }
    }
}
