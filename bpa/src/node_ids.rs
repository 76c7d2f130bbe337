use tundra_bpv6::eid::Eid;

/// The node identity, derived once at startup from the 16-bit link
/// address and never changed afterwards.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NodeId(u32);

impl NodeId {
    /// Derives the node id from a 16-bit link-layer address,
    /// little-endian: address `[a, b]` becomes `a + (b << 8)`.
    pub fn from_link_address(addr: [u8; 2]) -> Self {
        Self(addr[0] as u32 | (addr[1] as u32) << 8)
    }

    pub fn from_node_number(node: u32) -> Self {
        Self(node)
    }

    pub fn node_number(&self) -> u32 {
        self.0
    }

    /// The 16-bit link address this node answers to.
    pub fn link_address(&self) -> [u8; 2] {
        [(self.0 & 0xFF) as u8, ((self.0 >> 8) & 0xFF) as u8]
    }

    /// The endpoint `ipn:<node>.<service>` on this node.
    pub fn endpoint(&self, service: u32) -> Eid {
        Eid::new(self.0, service)
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ipn:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_address_round_trip() {
        let id = NodeId::from_link_address([0x34, 0x12]);
        assert_eq!(id.node_number(), 0x1234);
        assert_eq!(id.link_address(), [0x34, 0x12]);
        assert_eq!(id.to_string(), "ipn:4660");
    }
}
