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

//! BOLT-2 channel types and channel feature negotiation.

use std::str::FromStr;

use crate::bolt9::{Feature, FeatureSupport, Features};

/// Channel types are an explicit enumeration: for convenience of future
/// definitions they reuse even feature bits, but they are not an arbitrary
/// combination (they represent the persistent features which affect the
/// channel operation).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum ChannelType {
    /// no features (no bits set)
    #[display("standard")]
    Standard,

    /// option_static_remotekey (bit 12)
    #[display("static_remotekey")]
    StaticRemotekey,

    /// option_anchor_outputs and option_static_remotekey (bits 20 and 12)
    #[display("anchor_outputs")]
    AnchorOutputs,
}

impl ChannelType {
    /// Detects whether channel has `option_static_remotekey` set
    #[inline]
    pub fn has_static_remotekey(self) -> bool {
        self != ChannelType::Standard
    }

    /// Detects whether channel has `option_anchor_outputs` set
    #[inline]
    pub fn has_anchor_outputs(self) -> bool {
        self == ChannelType::AnchorOutputs
    }

    /// Converts default channel type into `None` and non-default into
    /// `Some(ChannelType)`
    #[inline]
    pub fn into_option(self) -> Option<ChannelType> {
        match self {
            ChannelType::Standard => None,
            _ => Some(self),
        }
    }

    /// The defining feature set of the type: even persistent feature bits
    /// only.
    pub fn features(self) -> Features {
        let features = match self {
            ChannelType::Standard => Ok(Features::none()),
            ChannelType::StaticRemotekey => Features::with([(
                Feature::OptionStaticRemotekey,
                FeatureSupport::Mandatory,
            )]),
            ChannelType::AnchorOutputs => Features::with([
                (Feature::OptionStaticRemotekey, FeatureSupport::Mandatory),
                (Feature::OptionAnchorOutputs, FeatureSupport::Mandatory),
            ]),
        };
        match features {
            Ok(features) => features,
            Err(_) => unreachable!(
                "channel type feature sets are internally consistent"
            ),
        }
    }

    /// Recognizes a channel type from an explicit feature set. Only an exact
    /// match on one of the defined sets yields a type; anything else is not a
    /// valid `channel_type`.
    pub fn from_features(features: &Features) -> Option<ChannelType> {
        [
            ChannelType::AnchorOutputs,
            ChannelType::StaticRemotekey,
            ChannelType::Standard,
        ]
        .into_iter()
        .find(|channel_type| channel_type.features() == *features)
    }

    /// Selects the strongest channel type usable by both peers, judged by the
    /// features each has announced at any requirement level.
    pub fn pick(local: &Features, remote: &Features) -> ChannelType {
        let both = |feature: Feature| {
            local.contains(feature) && remote.contains(feature)
        };
        if both(Feature::OptionStaticRemotekey)
            && both(Feature::OptionAnchorOutputs)
        {
            ChannelType::AnchorOutputs
        } else if both(Feature::OptionStaticRemotekey) {
            ChannelType::StaticRemotekey
        } else {
            ChannelType::Standard
        }
    }
}

impl Default for ChannelType {
    #[inline]
    fn default() -> Self {
        ChannelType::Standard
    }
}

/// Error parsing [`ChannelType`] from strings
#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error)]
#[display("unknown channel type name `{0}`")]
pub struct ChannelTypeParseError(String);

impl FromStr for ChannelType {
    type Err = ChannelTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "standard" => ChannelType::Standard,
            "static_remotekey" => ChannelType::StaticRemotekey,
            "anchor_outputs" => ChannelType::AnchorOutputs,
            _ => return Err(ChannelTypeParseError(s.to_owned())),
        })
    }
}

/// Commitment transaction format implied by the negotiated channel type.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum CommitmentFormat {
    /// Pre-anchor commitment outputs
    #[display("default")]
    Default,

    /// Commitments carry anchor outputs for fee-bumping
    #[display("anchor_outputs")]
    AnchorOutputs,
}

/// Persistent features of a channel: its structural type plus the
/// non-structural features both peers support (e.g. wumbo).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display("{channel_type}")]
pub struct ChannelFeatures {
    pub channel_type: ChannelType,
    pub features: Features,
}

impl ChannelFeatures {
    /// Negotiates the channel features for a new channel: the strongest
    /// channel type usable by both sides, augmented with the intersection of
    /// non-structural features.
    pub fn negotiate(local: &Features, remote: &Features) -> ChannelFeatures {
        let channel_type = ChannelType::pick(local, remote);
        let mut features = local.intersect(remote);
        features.unset(Feature::OptionStaticRemotekey);
        features.unset(Feature::OptionAnchorOutputs);
        features.unset(Feature::OptionAnchorZeroFeeHtlcTx);
        ChannelFeatures {
            channel_type,
            features,
        }
    }

    /// Whether the remote output of the commitment pays straight to a wallet
    /// address without a second-stage claim.
    pub fn pays_directly_to_wallet(&self) -> bool {
        self.channel_type.has_static_remotekey()
            && !self.channel_type.has_anchor_outputs()
    }

    pub fn commitment_format(&self) -> CommitmentFormat {
        if self.channel_type.has_anchor_outputs() {
            CommitmentFormat::AnchorOutputs
        } else {
            CommitmentFormat::Default
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn features(
        pairs: &[(Feature, FeatureSupport)],
    ) -> Features {
        Features::with(pairs.iter().copied()).unwrap()
    }

    #[test]
    fn pick_prefers_anchor_outputs() {
        let local = features(&[
            (Feature::OptionStaticRemotekey, FeatureSupport::Mandatory),
            (Feature::OptionAnchorOutputs, FeatureSupport::Optional),
        ]);
        let remote = features(&[
            (Feature::OptionStaticRemotekey, FeatureSupport::Optional),
            (Feature::OptionAnchorOutputs, FeatureSupport::Optional),
        ]);
        assert_eq!(
            ChannelType::pick(&local, &remote),
            ChannelType::AnchorOutputs
        );
    }

    #[test]
    fn pick_falls_back_to_standard() {
        let local = features(&[(
            Feature::OptionStaticRemotekey,
            FeatureSupport::Mandatory,
        )]);
        let remote = Features::none();
        assert_eq!(ChannelType::pick(&local, &remote), ChannelType::Standard);
    }

    #[test]
    fn from_features_requires_exact_match() {
        assert_eq!(
            ChannelType::from_features(&Features::none()),
            Some(ChannelType::Standard)
        );
        assert_eq!(
            ChannelType::from_features(&features(&[(
                Feature::OptionStaticRemotekey,
                FeatureSupport::Mandatory
            )])),
            Some(ChannelType::StaticRemotekey)
        );
        assert_eq!(
            ChannelType::from_features(&features(&[
                (Feature::OptionStaticRemotekey, FeatureSupport::Mandatory),
                (Feature::OptionAnchorOutputs, FeatureSupport::Mandatory),
            ])),
            Some(ChannelType::AnchorOutputs)
        );
        // extra features break the exact match
        assert_eq!(
            ChannelType::from_features(&features(&[
                (Feature::OptionStaticRemotekey, FeatureSupport::Mandatory),
                (
                    Feature::OptionSupportLargeChannel,
                    FeatureSupport::Mandatory
                ),
            ])),
            None
        );
        // so does a wrong requirement level
        assert_eq!(
            ChannelType::from_features(&features(&[(
                Feature::OptionStaticRemotekey,
                FeatureSupport::Optional
            )])),
            None
        );
    }

    #[test]
    fn negotiation_carries_wumbo() {
        let local = features(&[
            (Feature::OptionStaticRemotekey, FeatureSupport::Mandatory),
            (Feature::OptionAnchorOutputs, FeatureSupport::Optional),
            (Feature::OptionSupportLargeChannel, FeatureSupport::Optional),
        ]);
        let remote = features(&[
            (Feature::OptionStaticRemotekey, FeatureSupport::Optional),
            (Feature::OptionAnchorOutputs, FeatureSupport::Optional),
            (Feature::OptionSupportLargeChannel, FeatureSupport::Mandatory),
        ]);
        let negotiated = ChannelFeatures::negotiate(&local, &remote);
        assert_eq!(negotiated.channel_type, ChannelType::AnchorOutputs);
        assert!(negotiated
            .features
            .contains(Feature::OptionSupportLargeChannel));
        assert!(!negotiated.features.contains(Feature::OptionAnchorOutputs));
        assert_eq!(
            negotiated.commitment_format(),
            CommitmentFormat::AnchorOutputs
        );
        assert!(!negotiated.pays_directly_to_wallet());
    }

    #[test]
    fn static_remotekey_pays_directly_to_wallet() {
        let local = features(&[(
            Feature::OptionStaticRemotekey,
            FeatureSupport::Mandatory,
        )]);
        let remote = features(&[(
            Feature::OptionStaticRemotekey,
            FeatureSupport::Optional,
        )]);
        let negotiated = ChannelFeatures::negotiate(&local, &remote);
        assert_eq!(negotiated.channel_type, ChannelType::StaticRemotekey);
        assert!(negotiated.pays_directly_to_wallet());
        assert_eq!(negotiated.commitment_format(), CommitmentFormat::Default);
    }

    #[test]
    fn channel_type_strings() {
        for channel_type in [
            ChannelType::Standard,
            ChannelType::StaticRemotekey,
            ChannelType::AnchorOutputs,
        ] {
            assert_eq!(
                channel_type.to_string().parse::<ChannelType>().unwrap(),
                channel_type
            );
        }
        assert!("anchored_zero_fee".parse::<ChannelType>().is_err());
    }
}
