// LN core library: on-chain watcher & gossip router for the Lightning Network.
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Identifiers and small wire types shared by all BOLT message families.

use std::fmt::{self, Display, Formatter};
use std::net::{SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use amplify::{Slice32, Wrapper};
use bitcoin::{OutPoint, Txid};

/// Lightning network short channel id as per BOLT-7: the on-chain locator of
/// the funding output, packed as 24 bits of block height, 24 bits of
/// transaction index and 16 bits of output index.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Display,
    Default
)]
#[display("{block_height}x{tx_index}x{output_index}")]
pub struct ShortChannelId {
    pub block_height: u32,
    pub tx_index: u32,
    pub output_index: u16,
}

impl ShortChannelId {
    /// Constructs a short channel id, returning `None` when the block height
    /// or transaction index do not fit their 24-bit fields.
    pub fn new(
        block_height: u32,
        tx_index: u32,
        output_index: u16,
    ) -> Option<Self> {
        if block_height >= 1 << 24 || tx_index >= 1 << 24 {
            return None;
        }
        Some(ShortChannelId {
            block_height,
            tx_index,
            output_index,
        })
    }

    /// Packs the three components into the 64-bit wire representation.
    pub fn to_u64(self) -> u64 {
        (self.block_height as u64) << 40
            | (self.tx_index as u64) << 16
            | self.output_index as u64
    }

    /// Unpacks the 64-bit wire representation.
    pub fn from_u64(value: u64) -> Self {
        ShortChannelId {
            block_height: (value >> 40) as u32 & 0x00FF_FFFF,
            tx_index: (value >> 16) as u32 & 0x00FF_FFFF,
            output_index: value as u16,
        }
    }

    /// Funding outpoint of the channel, given the funding transaction id.
    pub fn outpoint(&self, funding_txid: Txid) -> OutPoint {
        OutPoint::new(funding_txid, self.output_index as u32)
    }
}

impl From<u64> for ShortChannelId {
    fn from(value: u64) -> Self {
        ShortChannelId::from_u64(value)
    }
}

impl From<ShortChannelId> for u64 {
    fn from(scid: ShortChannelId) -> Self {
        scid.to_u64()
    }
}

#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error
)]
#[display(doc_comments)]
pub enum ShortChannelIdParseError {
    /// Wrong block height data
    WrongBlockHeight,
    /// Wrong transaction index number
    WrongTxIndex,
    /// Wrong output index number
    WrongOutputIndex,
    /// too many short channel id components; expected three (block height,
    /// tx index and output index)
    ExcessiveComponents,
}

impl FromStr for ShortChannelId {
    type Err = ShortChannelIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut split = s.split('x');
        match (split.next(), split.next(), split.next(), split.next()) {
            (Some(block_height), Some(tx_index), Some(output_index), None) => {
                Ok(ShortChannelId {
                    block_height: block_height.parse().map_err(|_| {
                        ShortChannelIdParseError::WrongBlockHeight
                    })?,
                    tx_index: tx_index
                        .parse()
                        .map_err(|_| ShortChannelIdParseError::WrongTxIndex)?,
                    output_index: output_index.parse().map_err(|_| {
                        ShortChannelIdParseError::WrongOutputIndex
                    })?,
                })
            }
            _ => Err(ShortChannelIdParseError::ExcessiveComponents),
        }
    }
}

/// Full channel id as per BOLT-2: funding txid XOR-ed with the funding output
/// index. Used to address local channels before and after announcement.
#[derive(
    Wrapper,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Display,
    Default,
    From
)]
#[display(LowerHex)]
#[wrapper(FromStr, LowerHex, UpperHex)]
pub struct ChannelId(Slice32);

impl From<[u8; 32]> for ChannelId {
    fn from(array: [u8; 32]) -> Self {
        ChannelId(Slice32::from_inner(array))
    }
}

/// Node alias from `node_announcement`, a fixed 32-byte field zero-padded on
/// the wire.
#[derive(
    Wrapper,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Display,
    Default,
    From
)]
#[display(LowerHex)]
#[wrapper(FromStr, LowerHex, UpperHex)]
pub struct Alias(Slice32);

impl Alias {
    pub fn to_array(self) -> [u8; 32] {
        self.0.into_inner()
    }
}

impl From<[u8; 32]> for Alias {
    fn from(array: [u8; 32]) -> Self {
        Alias(Slice32::from_inner(array))
    }
}

/// RGB color from `node_announcement`.
#[derive(
    Wrapper,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Default,
    From
)]
pub struct NodeColor([u8; 3]);

impl NodeColor {
    pub fn to_array(self) -> [u8; 3] {
        self.0
    }
}

impl Display for NodeColor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

/// Network address of a node as announced in `node_announcement`.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display
)]
pub enum NetAddress {
    /// IPv4 address and port
    #[display("{0}")]
    Ipv4(SocketAddrV4),

    /// IPv6 address and port
    #[display("{0}")]
    Ipv6(SocketAddrV6),
}

impl NetAddress {
    /// Appends the BOLT-7 wire form (type byte, address bytes, port) used for
    /// signature hashing.
    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            NetAddress::Ipv4(addr) => {
                buf.push(1);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            NetAddress::Ipv6(addr) => {
                buf.push(2);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
        }
    }
}

/// Ordered list of announced node addresses.
#[derive(Wrapper, Clone, PartialEq, Eq, Hash, Debug, Default, From)]
pub struct AddressList(Vec<NetAddress>);

impl AddressList {
    pub fn iter(&self) -> std::slice::Iter<NetAddress> {
        self.0.iter()
    }

    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.0.len() as u16).to_be_bytes());
        for addr in &self.0 {
            addr.write_to(buf);
        }
    }
}

impl Display for AddressList {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for addr in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            Display::fmt(addr, f)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn short_channel_id_u64_round_trip() {
        let scid = ShortChannelId::new(697_000, 42, 7).unwrap();
        let packed = scid.to_u64();
        assert_eq!(packed, (697_000u64 << 40) | (42 << 16) | 7);
        assert_eq!(ShortChannelId::from_u64(packed), scid);
    }

    #[test]
    fn funding_outpoint_uses_the_output_index() {
        use bitcoin::hashes::Hash;
        let scid = ShortChannelId::new(697_000, 42, 7).unwrap();
        let txid = Txid::from_slice(&[0xab; 32]).unwrap();
        assert_eq!(scid.outpoint(txid), OutPoint::new(txid, 7));
    }

    #[test]
    fn short_channel_id_str_round_trip() {
        let scid = ShortChannelId::new(600_000, 1337, 1).unwrap();
        assert_eq!(scid.to_string(), "600000x1337x1");
        assert_eq!("600000x1337x1".parse::<ShortChannelId>().unwrap(), scid);
        assert_eq!(
            "1x2x3x4".parse::<ShortChannelId>(),
            Err(ShortChannelIdParseError::ExcessiveComponents)
        );
    }

    #[test]
    fn short_channel_id_bounds() {
        assert!(ShortChannelId::new(1 << 24, 0, 0).is_none());
        assert!(ShortChannelId::new(0, 1 << 24, 0).is_none());
        assert!(ShortChannelId::new((1 << 24) - 1, (1 << 24) - 1, u16::MAX)
            .is_some());
    }
}
