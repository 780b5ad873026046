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

//! BOLT-11 invoice codec.
//!
//! Invoices are bech32 strings whose human-readable part carries the network
//! prefix and an optional amount, and whose data part carries a 35-bit
//! timestamp, tagged fields and a 65-byte recoverable signature over
//! `hrp || data`. Unknown tagged fields are preserved verbatim so that
//! re-encoding a decoded invoice reproduces the original string.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use amplify::{Slice32, Wrapper};
use bech32::{u5, FromBase32, ToBase32, Variant};
use bitcoin::hashes::{sha256, Hash};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};

use crate::types::ShortChannelId;

/// Largest amount an invoice may ask for, in milli-satoshi.
pub const MAX_INVOICE_AMOUNT_MSAT: u64 = 1 << 32;

const MSAT_PER_BTC: u64 = 100_000_000_000;
const MSAT_PER_MILLI: u64 = 100_000_000;
const MSAT_PER_MICRO: u64 = 100_000;
const MSAT_PER_NANO: u64 = 100;
const MSAT_PER_PICO: u64 = 10;

// Tag letters in bech32 character indexes
const TAG_PAYMENT_HASH: u8 = 1; // 'p'
const TAG_ROUTING_INFO: u8 = 3; // 'r'
const TAG_EXPIRY: u8 = 6; // 'x'
const TAG_FALLBACK: u8 = 9; // 'f'
const TAG_DESCRIPTION: u8 = 13; // 'd'
const TAG_DESCRIPTION_HASH: u8 = 23; // 'h'

const SIGNATURE_GROUPS: usize = 104;
const TIMESTAMP_GROUPS: usize = 7;

/// BOLT-11 codec errors
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// invoice string is not valid bech32: {0}
    Bech32(String),

    /// invoice data section is too short to contain a timestamp and a
    /// signature
    TooShort,

    /// unknown invoice prefix in human-readable part `{0}`
    UnknownPrefix(String),

    /// invalid amount in human-readable part: {0}
    MalformedAmount(String),

    /// invoice amount of {0} msat is outside of the (0, 2^32] msat range
    AmountOutOfRange(u64),

    /// amount of {0} msat cannot be represented by any BOLT-11 multiplier
    AmountUnrepresentable(u64),

    /// a tagged field is truncated or carries a malformed payload
    InvalidTagPayload,

    /// invoice must contain exactly one payment hash tag
    PaymentHashCount,

    /// invoice must contain exactly one of description or description hash
    DescriptionCount,

    /// invalid recoverable signature encoding
    InvalidSignature,

    /// recovered node id does not match the invoice node id
    NodeIdMismatch,
}

/// Network prefix of the human-readable part.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum Prefix {
    /// Bitcoin mainnet
    #[display("lnbc")]
    Bitcoin,

    /// Bitcoin testnet
    #[display("lntb")]
    Testnet,
}

/// Raw recoverable signature: `r || s` plus the recovery id selecting among
/// the candidate public keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RecoverableSig {
    pub signature: [u8; 64],
    pub recovery_id: u8,
}

impl RecoverableSig {
    fn to_secp(self) -> Result<RecoverableSignature, Error> {
        let recovery_id = RecoveryId::from_i32(self.recovery_id as i32)
            .map_err(|_| Error::InvalidSignature)?;
        RecoverableSignature::from_compact(&self.signature, recovery_id)
            .map_err(|_| Error::InvalidSignature)
    }

    fn from_secp(signature: RecoverableSignature) -> RecoverableSig {
        let (recovery_id, bytes) = signature.serialize_compact();
        RecoverableSig {
            signature: bytes,
            recovery_id: recovery_id.to_i32() as u8,
        }
    }
}

/// One hop of a private routing hint (`r` tag).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RoutingHint {
    pub node_id: PublicKey,
    pub short_channel_id: ShortChannelId,
    pub fee_msat: u64,
    pub cltv_expiry_delta: u16,
}

/// Tagged field of the invoice data part.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TaggedField {
    /// `p`: SHA256 payment hash
    PaymentHash(Slice32),

    /// `d`: short utf-8 description of the payment purpose
    Description(String),

    /// `h`: SHA256 of a longer description made available out of band
    DescriptionHash(Slice32),

    /// `f`: on-chain fallback address (version byte plus hash)
    FallbackAddress { version: u8, program: Vec<u8> },

    /// `r`: private routing hints towards the destination
    RoutingInfo(Vec<RoutingHint>),

    /// `x`: invoice expiry in seconds
    Expiry(u64),

    /// Any tag this implementation does not interpret, kept verbatim as
    /// 5-bit values
    Unknown { tag: u8, data: Vec<u8> },
}

/// A decoded (or to-be-encoded) BOLT-11 invoice.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Invoice {
    pub prefix: Prefix,
    pub amount_msat: Option<u64>,
    /// Issue time, in seconds since the UNIX epoch (35 bits on the wire)
    pub timestamp: u64,
    /// Destination node; always equal to the key recovered from the
    /// signature
    pub node_id: PublicKey,
    pub tags: Vec<TaggedField>,
    pub signature: RecoverableSig,
}

impl Invoice {
    /// Builds and signs an invoice. The destination node id is derived from
    /// the signing key.
    pub fn new_signed(
        prefix: Prefix,
        amount_msat: Option<u64>,
        timestamp: u64,
        tags: Vec<TaggedField>,
        node_key: &SecretKey,
    ) -> Result<Invoice, Error> {
        let mut invoice = Invoice {
            prefix,
            amount_msat,
            timestamp,
            node_id: PublicKey::from_secret_key(SECP256K1, node_key),
            tags,
            signature: RecoverableSig {
                signature: [0u8; 64],
                recovery_id: 0,
            },
        };
        invoice.validate()?;
        let msg = invoice.signing_message()?;
        let signature = SECP256K1.sign_ecdsa_recoverable(&msg, node_key);
        invoice.signature = RecoverableSig::from_secp(signature);
        Ok(invoice)
    }

    /// Encodes the invoice into its bech32 string form.
    pub fn encode(&self) -> Result<String, Error> {
        let hrp = self.hrp()?;
        let mut data = self.data_without_signature();
        let mut signature = self.signature.signature.to_vec();
        signature.push(self.signature.recovery_id);
        data.extend(signature.to_base32());
        bech32::encode(&hrp, &data, Variant::Bech32)
            .map_err(|e| Error::Bech32(e.to_string()))
    }

    /// Decodes an invoice string, recovering the destination node id from
    /// the embedded signature.
    pub fn decode(s: &str) -> Result<Invoice, Error> {
        let (hrp, data, variant) =
            bech32::decode(s).map_err(|e| Error::Bech32(e.to_string()))?;
        if variant != Variant::Bech32 {
            return Err(Error::Bech32(s!("bech32m variant is not allowed")));
        }
        let (prefix, amount_msat) = parse_hrp(&hrp)?;
        if data.len() < TIMESTAMP_GROUPS + SIGNATURE_GROUPS {
            return Err(Error::TooShort);
        }

        let timestamp = u5_to_u64(&data[..TIMESTAMP_GROUPS])?;
        let signature_start = data.len() - SIGNATURE_GROUPS;
        let tags = parse_tags(&data[TIMESTAMP_GROUPS..signature_start])?;

        let signature_bytes =
            Vec::<u8>::from_base32(&data[signature_start..])
                .map_err(|_| Error::InvalidSignature)?;
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&signature_bytes[..64]);
        let signature = RecoverableSig {
            signature,
            recovery_id: signature_bytes[64],
        };

        let msg = signing_message(&hrp, &data[..signature_start]);
        let node_id = SECP256K1
            .recover_ecdsa(&msg, &signature.to_secp()?)
            .map_err(|_| Error::InvalidSignature)?;

        let invoice = Invoice {
            prefix,
            amount_msat,
            timestamp,
            node_id,
            tags,
            signature,
        };
        invoice.validate()?;
        Ok(invoice)
    }

    /// Re-derives the signer key and compares it to the declared node id.
    pub fn check_signature(&self) -> Result<(), Error> {
        let recovered = SECP256K1
            .recover_ecdsa(&self.signing_message()?, &self.signature.to_secp()?)
            .map_err(|_| Error::InvalidSignature)?;
        if recovered != self.node_id {
            return Err(Error::NodeIdMismatch);
        }
        Ok(())
    }

    pub fn payment_hash(&self) -> Option<Slice32> {
        self.tags.iter().find_map(|tag| match tag {
            TaggedField::PaymentHash(hash) => Some(*hash),
            _ => None,
        })
    }

    pub fn description(&self) -> Option<&str> {
        self.tags.iter().find_map(|tag| match tag {
            TaggedField::Description(d) => Some(d.as_str()),
            _ => None,
        })
    }

    pub fn expiry(&self) -> Option<u64> {
        self.tags.iter().find_map(|tag| match tag {
            TaggedField::Expiry(seconds) => Some(*seconds),
            _ => None,
        })
    }

    fn validate(&self) -> Result<(), Error> {
        if let Some(amount) = self.amount_msat {
            if amount == 0 || amount > MAX_INVOICE_AMOUNT_MSAT {
                return Err(Error::AmountOutOfRange(amount));
            }
            encode_amount(amount)?;
        }
        let payment_hashes = self
            .tags
            .iter()
            .filter(|tag| matches!(tag, TaggedField::PaymentHash(_)))
            .count();
        if payment_hashes != 1 {
            return Err(Error::PaymentHashCount);
        }
        let descriptions = self
            .tags
            .iter()
            .filter(|tag| {
                matches!(
                    tag,
                    TaggedField::Description(_)
                        | TaggedField::DescriptionHash(_)
                )
            })
            .count();
        if descriptions != 1 {
            return Err(Error::DescriptionCount);
        }
        Ok(())
    }

    fn hrp(&self) -> Result<String, Error> {
        match self.amount_msat {
            Some(amount) => {
                Ok(format!("{}{}", self.prefix, encode_amount(amount)?))
            }
            None => Ok(self.prefix.to_string()),
        }
    }

    fn data_without_signature(&self) -> Vec<u5> {
        let mut data = u64_to_u5(self.timestamp, TIMESTAMP_GROUPS);
        for tag in &self.tags {
            let (tag_value, payload) = tag_payload(tag);
            data.push(small_u5(tag_value));
            data.push(small_u5((payload.len() / 32) as u8));
            data.push(small_u5((payload.len() % 32) as u8));
            data.extend(payload);
        }
        data
    }

    fn signing_message(&self) -> Result<Message, Error> {
        Ok(signing_message(&self.hrp()?, &self.data_without_signature()))
    }
}

impl Display for Invoice {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode().map_err(|_| fmt::Error)?)
    }
}

impl FromStr for Invoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Invoice::decode(s)
    }
}

/// Picks the shortest amount representation: the largest multiplier that
/// divides the amount exactly.
fn encode_amount(msat: u64) -> Result<String, Error> {
    if msat == 0 || msat > MAX_INVOICE_AMOUNT_MSAT {
        return Err(Error::AmountOutOfRange(msat));
    }
    // whole-bitcoin amounts (no multiplier letter) are above the cap, so
    // the ladder starts at milli
    if msat % MSAT_PER_MILLI == 0 {
        Ok(format!("{}m", msat / MSAT_PER_MILLI))
    } else if msat % MSAT_PER_MICRO == 0 {
        Ok(format!("{}u", msat / MSAT_PER_MICRO))
    } else if msat % MSAT_PER_NANO == 0 {
        Ok(format!("{}n", msat / MSAT_PER_NANO))
    } else if msat % MSAT_PER_PICO == 0 {
        Ok(format!("{}p", msat / MSAT_PER_PICO))
    } else {
        Err(Error::AmountUnrepresentable(msat))
    }
}

fn parse_hrp(hrp: &str) -> Result<(Prefix, Option<u64>), Error> {
    let (prefix, rest) = if let Some(rest) = hrp.strip_prefix("lnbc") {
        (Prefix::Bitcoin, rest)
    } else if let Some(rest) = hrp.strip_prefix("lntb") {
        (Prefix::Testnet, rest)
    } else {
        return Err(Error::UnknownPrefix(hrp.to_owned()));
    };
    if rest.is_empty() {
        return Ok((prefix, None));
    }

    let (digits, multiplier) = match rest.chars().last() {
        Some('m') => (&rest[..rest.len() - 1], MSAT_PER_MILLI),
        Some('u') => (&rest[..rest.len() - 1], MSAT_PER_MICRO),
        Some('n') => (&rest[..rest.len() - 1], MSAT_PER_NANO),
        Some('p') => (&rest[..rest.len() - 1], MSAT_PER_PICO),
        Some(c) if c.is_ascii_digit() => (rest, MSAT_PER_BTC),
        _ => return Err(Error::MalformedAmount(rest.to_owned())),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::MalformedAmount(rest.to_owned()))?;
    let msat = value
        .checked_mul(multiplier)
        .ok_or(Error::AmountOutOfRange(u64::MAX))?;
    if msat == 0 || msat > MAX_INVOICE_AMOUNT_MSAT {
        return Err(Error::AmountOutOfRange(msat));
    }
    Ok((prefix, Some(msat)))
}

fn tag_payload(tag: &TaggedField) -> (u8, Vec<u5>) {
    match tag {
        TaggedField::PaymentHash(hash) => {
            (TAG_PAYMENT_HASH, hash.as_inner().to_base32())
        }
        TaggedField::Description(description) => {
            (TAG_DESCRIPTION, description.as_bytes().to_base32())
        }
        TaggedField::DescriptionHash(hash) => {
            (TAG_DESCRIPTION_HASH, hash.as_inner().to_base32())
        }
        TaggedField::FallbackAddress { version, program } => {
            let mut bytes = vec![*version];
            bytes.extend_from_slice(program);
            (TAG_FALLBACK, bytes.to_base32())
        }
        TaggedField::RoutingInfo(hints) => {
            let mut bytes = Vec::with_capacity(hints.len() * 51);
            for hint in hints {
                bytes.extend_from_slice(&hint.node_id.serialize());
                bytes.extend_from_slice(
                    &hint.short_channel_id.to_u64().to_be_bytes(),
                );
                bytes.extend_from_slice(&hint.fee_msat.to_be_bytes());
                bytes.extend_from_slice(
                    &hint.cltv_expiry_delta.to_be_bytes(),
                );
            }
            (TAG_ROUTING_INFO, bytes.to_base32())
        }
        TaggedField::Expiry(seconds) => {
            let mut groups = Vec::new();
            let mut rest = *seconds;
            while rest > 0 {
                groups.push(small_u5((rest & 0x1f) as u8));
                rest >>= 5;
            }
            groups.reverse();
            (TAG_EXPIRY, groups)
        }
        TaggedField::Unknown { tag, data } => {
            (*tag, data.iter().map(|v| small_u5(*v)).collect())
        }
    }
}

fn parse_tags(data: &[u5]) -> Result<Vec<TaggedField>, Error> {
    let mut tags = Vec::new();
    let mut cursor = 0;
    while cursor < data.len() {
        if cursor + 3 > data.len() {
            return Err(Error::InvalidTagPayload);
        }
        let tag = data[cursor].to_u8();
        let length =
            data[cursor + 1].to_u8() as usize * 32 + data[cursor + 2].to_u8() as usize;
        cursor += 3;
        if cursor + length > data.len() {
            return Err(Error::InvalidTagPayload);
        }
        tags.push(parse_tag(tag, &data[cursor..cursor + length])?);
        cursor += length;
    }
    Ok(tags)
}

fn parse_tag(tag: u8, payload: &[u5]) -> Result<TaggedField, Error> {
    let keep_unknown = || TaggedField::Unknown {
        tag,
        data: payload.iter().map(|v| v.to_u8()).collect(),
    };
    Ok(match tag {
        TAG_PAYMENT_HASH | TAG_DESCRIPTION_HASH if payload.len() == 52 => {
            let bytes = Vec::<u8>::from_base32(payload)
                .map_err(|_| Error::InvalidTagPayload)?;
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&bytes);
            if tag == TAG_PAYMENT_HASH {
                TaggedField::PaymentHash(Slice32::from_inner(hash))
            } else {
                TaggedField::DescriptionHash(Slice32::from_inner(hash))
            }
        }
        // hash tags of an unexpected length are kept opaque
        TAG_PAYMENT_HASH | TAG_DESCRIPTION_HASH => keep_unknown(),
        TAG_DESCRIPTION => {
            let bytes = Vec::<u8>::from_base32(payload)
                .map_err(|_| Error::InvalidTagPayload)?;
            TaggedField::Description(
                String::from_utf8(bytes)
                    .map_err(|_| Error::InvalidTagPayload)?,
            )
        }
        TAG_FALLBACK => {
            let bytes = Vec::<u8>::from_base32(payload)
                .map_err(|_| Error::InvalidTagPayload)?;
            if bytes.is_empty() {
                return Err(Error::InvalidTagPayload);
            }
            TaggedField::FallbackAddress {
                version: bytes[0],
                program: bytes[1..].to_vec(),
            }
        }
        TAG_ROUTING_INFO => {
            let bytes = Vec::<u8>::from_base32(payload)
                .map_err(|_| Error::InvalidTagPayload)?;
            if bytes.is_empty() || bytes.len() % 51 != 0 {
                return Ok(keep_unknown());
            }
            let mut hints = Vec::with_capacity(bytes.len() / 51);
            for chunk in bytes.chunks(51) {
                hints.push(RoutingHint {
                    node_id: PublicKey::from_slice(&chunk[..33])
                        .map_err(|_| Error::InvalidTagPayload)?,
                    short_channel_id: ShortChannelId::from_u64(
                        u64::from_be_bytes(
                            chunk[33..41]
                                .try_into()
                                .expect("8-byte slice"),
                        ),
                    ),
                    fee_msat: u64::from_be_bytes(
                        chunk[41..49].try_into().expect("8-byte slice"),
                    ),
                    cltv_expiry_delta: u16::from_be_bytes(
                        chunk[49..51].try_into().expect("2-byte slice"),
                    ),
                });
            }
            TaggedField::RoutingInfo(hints)
        }
        TAG_EXPIRY => TaggedField::Expiry(u5_to_u64(payload)?),
        _ => keep_unknown(),
    })
}

/// Hash committed to by the invoice signature: SHA256 over the utf-8 bytes
/// of the human-readable part followed by the data part packed to bytes with
/// the final group right-padded.
fn signing_message(hrp: &str, data: &[u5]) -> Message {
    let mut preimage = hrp.as_bytes().to_vec();
    preimage.extend(
        bech32::convert_bits(data, 5, 8, true)
            .expect("5-to-8 expansion with padding cannot fail"),
    );
    let digest = sha256::Hash::hash(&preimage);
    Message::from_slice(&digest.into_inner())
        .expect("32-byte digest always makes a valid message")
}

fn small_u5(value: u8) -> u5 {
    u5::try_from_u8(value & 0x1f).expect("masked to 5 bits")
}

fn u64_to_u5(value: u64, groups: usize) -> Vec<u5> {
    (0..groups)
        .rev()
        .map(|shift| small_u5((value >> (5 * shift)) as u8))
        .collect()
}

fn u5_to_u64(groups: &[u5]) -> Result<u64, Error> {
    if groups.len() > 12 {
        return Err(Error::InvalidTagPayload);
    }
    Ok(groups
        .iter()
        .fold(0u64, |acc, group| acc << 5 | group.to_u8() as u64))
}

#[cfg(test)]
mod test {
    use super::*;

    fn node_key() -> SecretKey {
        SecretKey::from_slice(&[0x42; 32]).unwrap()
    }

    fn payment_hash() -> Slice32 {
        let mut hash = [0u8; 32];
        for (i, byte) in hash.iter_mut().enumerate() {
            *byte = i as u8;
        }
        Slice32::from_inner(hash)
    }

    fn coffee_invoice() -> Invoice {
        Invoice::new_signed(
            Prefix::Bitcoin,
            Some(250_000_000), // 2500 uBTC
            1_500_000_000,
            vec![
                TaggedField::PaymentHash(payment_hash()),
                TaggedField::Description(s!("coffee")),
            ],
            &node_key(),
        )
        .unwrap()
    }

    #[test]
    fn invoice_round_trip() {
        let invoice = coffee_invoice();
        let encoded = invoice.encode().unwrap();
        assert!(encoded.starts_with("lnbc2500u1"));

        let decoded = Invoice::decode(&encoded).unwrap();
        assert_eq!(decoded, invoice);
        assert_eq!(decoded.encode().unwrap(), encoded);
        assert_eq!(
            decoded.node_id,
            PublicKey::from_secret_key(SECP256K1, &node_key())
        );
        decoded.check_signature().unwrap();
        assert_eq!(decoded.description(), Some("coffee"));
        assert_eq!(decoded.payment_hash(), Some(payment_hash()));
    }

    #[test]
    fn amount_unit_selection() {
        assert_eq!(encode_amount(250_000_000).unwrap(), "2500u");
        assert_eq!(encode_amount(100_000_000).unwrap(), "1m");
        assert_eq!(encode_amount(100).unwrap(), "1n");
        assert_eq!(encode_amount(10).unwrap(), "1p");
        assert_eq!(encode_amount(12_345_670).unwrap(), "1234567p");
        assert_eq!(encode_amount(15), Err(Error::AmountUnrepresentable(15)));
        assert_eq!(encode_amount(0), Err(Error::AmountOutOfRange(0)));
        // a whole bitcoin is far above the invoice cap
        assert!(matches!(
            encode_amount(100_000_000_000),
            Err(Error::AmountOutOfRange(_))
        ));
        assert_eq!(
            encode_amount(MAX_INVOICE_AMOUNT_MSAT + 1),
            Err(Error::AmountOutOfRange(MAX_INVOICE_AMOUNT_MSAT + 1))
        );
    }

    #[test]
    fn amount_parsing() {
        assert_eq!(
            parse_hrp("lnbc2500u").unwrap(),
            (Prefix::Bitcoin, Some(250_000_000))
        );
        assert_eq!(parse_hrp("lntb").unwrap(), (Prefix::Testnet, None));
        assert_eq!(
            parse_hrp("lnbc10p").unwrap(),
            (Prefix::Bitcoin, Some(100))
        );
        assert!(matches!(
            parse_hrp("lnxx1"),
            Err(Error::UnknownPrefix(_))
        ));
        assert!(matches!(
            parse_hrp("lnbc12q"),
            Err(Error::MalformedAmount(_))
        ));
    }

    #[test]
    fn optional_tags_round_trip() {
        let hint = RoutingHint {
            node_id: PublicKey::from_secret_key(
                SECP256K1,
                &SecretKey::from_slice(&[0x07; 32]).unwrap(),
            ),
            short_channel_id: ShortChannelId::new(600_123, 7, 1).unwrap(),
            fee_msat: 1_500,
            cltv_expiry_delta: 40,
        };
        let invoice = Invoice::new_signed(
            Prefix::Testnet,
            None,
            1_500_000_060,
            vec![
                TaggedField::PaymentHash(payment_hash()),
                TaggedField::DescriptionHash(payment_hash()),
                TaggedField::Expiry(60),
                TaggedField::FallbackAddress {
                    version: 17,
                    program: vec![0xab; 20],
                },
                TaggedField::RoutingInfo(vec![hint]),
                TaggedField::Unknown {
                    tag: 2,
                    data: vec![1, 2, 3],
                },
            ],
            &node_key(),
        )
        .unwrap();
        let encoded = invoice.encode().unwrap();
        let decoded = Invoice::decode(&encoded).unwrap();
        assert_eq!(decoded, invoice);
        assert_eq!(decoded.expiry(), Some(60));
        assert_eq!(decoded.encode().unwrap(), encoded);
    }

    #[test]
    fn tag_count_invariants() {
        let no_hash = Invoice::new_signed(
            Prefix::Bitcoin,
            None,
            0,
            vec![TaggedField::Description(s!("nope"))],
            &node_key(),
        );
        assert_eq!(no_hash.unwrap_err(), Error::PaymentHashCount);

        let both_descriptions = Invoice::new_signed(
            Prefix::Bitcoin,
            None,
            0,
            vec![
                TaggedField::PaymentHash(payment_hash()),
                TaggedField::Description(s!("one")),
                TaggedField::DescriptionHash(payment_hash()),
            ],
            &node_key(),
        );
        assert_eq!(both_descriptions.unwrap_err(), Error::DescriptionCount);
    }

    #[test]
    fn node_id_mismatch_is_detected() {
        let mut invoice = coffee_invoice();
        invoice.node_id = PublicKey::from_secret_key(
            SECP256K1,
            &SecretKey::from_slice(&[0x99; 32]).unwrap(),
        );
        assert_eq!(
            invoice.check_signature(),
            Err(Error::NodeIdMismatch)
        );
    }

    #[test]
    fn timestamp_is_35_bits() {
        let groups = u64_to_u5(1_500_000_000, TIMESTAMP_GROUPS);
        assert_eq!(groups.len(), 7);
        assert_eq!(u5_to_u64(&groups).unwrap(), 1_500_000_000);
    }
}
