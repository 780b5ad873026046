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

//! BOLT-9 feature flags and feature vectors.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use amplify::flags::FlagVec;

/// Feature-flags-related errors
#[derive(
    Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Hash, Debug, Display, Error,
    From
)]
#[display(doc_comments)]
pub enum Error {
    #[from]
    /// feature flags inconsistency: {0}
    FeaturesInconsistency(NoRequiredFeatureError),

    /// unknown even feature flag with number {0}
    UnknownEvenFeature(u16),
}

/// Errors from internal features inconsistency happening when a feature is
/// present, but it's required feature is not specified
#[derive(
    Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Hash, Debug, Display, Error
)]
#[display(doc_comments)]
pub enum NoRequiredFeatureError {
    /// `gossip_queries_ex` feature requires `gossip_queries` feature
    GossipQueries,

    /// `payment_secret` feature requires `var_onion_optin` feature
    VarOnionOptin,

    /// `basic_mpp` feature requires `payment_secret` feature
    PaymentSecret,

    /// `option_anchor_outputs` feature requires `option_static_remotekey`
    /// feature
    OptionStaticRemotekey,
}

/// Specific named feature flags
///
/// # Specification
/// <https://github.com/lightning/bolts/blob/master/09-features.md>
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[non_exhaustive]
#[repr(u16)]
pub enum Feature {
    /// Requires or supports extra `channel_reestablish` fields
    #[display("option_data_loss_protect", alt = "0/1")]
    OptionDataLossProtect = 0,

    /// Sending node needs a complete routing information dump
    #[display("initial_routing_sync", alt = "3")]
    InitialRoutingSync = 2,

    /// Commits to a shutdown scriptpubkey when opening channel
    #[display("option_upfront_shutdown_script", alt = "4/5")]
    OptionUpfrontShutdownScript = 4,

    /// More sophisticated gossip control
    #[display("gossip_queries", alt = "6/7")]
    GossipQueries = 6,

    /// Requires/supports variable-length routing onion payloads
    #[display("var_onion_optin", alt = "8/9")]
    VarOnionOptin = 8,

    /// Gossip queries can include additional information
    #[display("gossip_queries_ex", alt = "10/11")]
    GossipQueriesEx = 10,

    /// Static key for remote output
    #[display("option_static_remotekey", alt = "12/13")]
    OptionStaticRemotekey = 12,

    /// Node supports `payment_secret` field
    #[display("payment_secret", alt = "14/15")]
    PaymentSecret = 14,

    /// Node can receive basic multi-part payments
    #[display("basic_mpp", alt = "16/17")]
    BasicMpp = 16,

    /// Can create large ("wumbo") channels
    #[display("option_support_large_channel", alt = "18/19")]
    OptionSupportLargeChannel = 18,

    /// Anchor outputs
    #[display("option_anchor_outputs", alt = "20/21")]
    OptionAnchorOutputs = 20,

    /// Anchor commitment type with zero fee HTLC transactions
    #[display("option_anchors_zero_fee_htlc_tx", alt = "22/23")]
    OptionAnchorZeroFeeHtlcTx = 22,
    // NB: When adding new feature INCLUDE it into Feature::all
}

impl Feature {
    pub fn all() -> &'static [Feature] {
        &[
            Feature::OptionDataLossProtect,
            Feature::InitialRoutingSync,
            Feature::OptionUpfrontShutdownScript,
            Feature::GossipQueries,
            Feature::VarOnionOptin,
            Feature::GossipQueriesEx,
            Feature::OptionStaticRemotekey,
            Feature::PaymentSecret,
            Feature::BasicMpp,
            Feature::OptionSupportLargeChannel,
            Feature::OptionAnchorOutputs,
            Feature::OptionAnchorZeroFeeHtlcTx,
        ]
    }

    /// Returns number of bit that is set by the flag
    ///
    /// # Arguments
    /// `required`: which type of flag bit should be returned:
    /// - `false` for even (non-required) bit variant
    /// - `true` for odd (required) bit variant
    ///
    /// # Returns
    /// Bit number in feature vector if the feature is allowed for the provided
    /// `required` condition; `None` otherwise.
    pub fn bit(self, required: bool) -> Option<u16> {
        if self == Feature::InitialRoutingSync && required {
            return None;
        }
        Some(self as u16 + !required as u16)
    }

    /// Resolves a feature vector bit number into a feature and its
    /// requirement level.
    pub fn from_bit(bit: u16) -> Option<(Feature, FeatureSupport)> {
        let required = bit % 2 == 0;
        let support = if required {
            FeatureSupport::Mandatory
        } else {
            FeatureSupport::Optional
        };
        Feature::all()
            .iter()
            .find(|feature| feature.bit(required) == Some(bit))
            .map(|feature| (*feature, support))
    }
}

/// Requirement level of a feature bit: even bits are compulsory, odd bits are
/// an opt-in.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum FeatureSupport {
    /// Odd bit: peers not understanding the feature may still connect
    #[display("optional")]
    Optional,

    /// Even bit: "it's ok to be odd" does not apply
    #[display("mandatory")]
    Mandatory,
}

/// Set of features announced in `init` and `node_announcement` messages and
/// negotiated at channel opening.
///
/// Flags are numbered from the least-significant bit, at bit 0 (i.e. 0x1, an
/// even bit). They are generally assigned in pairs so that features can be
/// introduced as optional (odd bits) and later upgraded to be compulsory
/// (even bits), which will be refused by outdated nodes.
///
/// # Specification
/// <https://github.com/lightning/bolts/blob/master/09-features.md>
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Features(BTreeMap<Feature, FeatureSupport>);

impl Features {
    /// Empty feature set.
    pub fn none() -> Features {
        Features::default()
    }

    /// Constructs a feature set from feature/support pairs, checking internal
    /// consistency.
    pub fn with(
        features: impl IntoIterator<Item = (Feature, FeatureSupport)>,
    ) -> Result<Features, Error> {
        let features = Features(features.into_iter().collect());
        features.check_consistency()?;
        Ok(features)
    }

    pub fn set(&mut self, feature: Feature, support: FeatureSupport) {
        self.0.insert(feature, support);
    }

    pub fn unset(&mut self, feature: Feature) {
        self.0.remove(&feature);
    }

    pub fn contains(&self, feature: Feature) -> bool {
        self.0.contains_key(&feature)
    }

    pub fn support(&self, feature: Feature) -> Option<FeatureSupport> {
        self.0.get(&feature).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (Feature, FeatureSupport)> + '_ {
        self.0.iter().map(|(feature, support)| (*feature, *support))
    }

    pub fn check_consistency(&self) -> Result<(), NoRequiredFeatureError> {
        if self.contains(Feature::GossipQueriesEx)
            && !self.contains(Feature::GossipQueries)
        {
            return Err(NoRequiredFeatureError::GossipQueries);
        }
        if self.contains(Feature::PaymentSecret)
            && !self.contains(Feature::VarOnionOptin)
        {
            return Err(NoRequiredFeatureError::VarOnionOptin);
        }
        if self.contains(Feature::BasicMpp)
            && !self.contains(Feature::PaymentSecret)
        {
            return Err(NoRequiredFeatureError::PaymentSecret);
        }
        if self.contains(Feature::OptionAnchorOutputs)
            && !self.contains(Feature::OptionStaticRemotekey)
        {
            return Err(NoRequiredFeatureError::OptionStaticRemotekey);
        }
        Ok(())
    }

    /// Features present on both sides. The result is mandatory only where
    /// both sides require the feature.
    pub fn intersect(&self, other: &Features) -> Features {
        let mut intersection = Features::none();
        for (feature, support) in self.iter() {
            if let Some(other_support) = other.support(feature) {
                let support = if support == FeatureSupport::Mandatory
                    && other_support == FeatureSupport::Mandatory
                {
                    FeatureSupport::Mandatory
                } else {
                    FeatureSupport::Optional
                };
                intersection.set(feature, support);
            }
        }
        intersection
    }
}

impl Display for Features {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (feature, support) in self.iter() {
            Display::fmt(&feature, f)?;
            if support == FeatureSupport::Optional {
                f.write_str("?")?;
            }
            f.write_str(", ")?;
        }
        Ok(())
    }
}

impl TryFrom<FlagVec> for Features {
    type Error = Error;

    fn try_from(flags: FlagVec) -> Result<Self, Self::Error> {
        let mut features = Features::none();
        for bit in flags.iter() {
            match Feature::from_bit(bit) {
                Some((feature, support)) => features.set(feature, support),
                // Odd unknown bits are fine to ignore; even ones are not
                None if bit % 2 == 0 => {
                    return Err(Error::UnknownEvenFeature(bit))
                }
                None => {}
            }
        }
        features.check_consistency()?;
        Ok(features)
    }
}

impl From<&Features> for FlagVec {
    fn from(features: &Features) -> Self {
        let mut flags = FlagVec::new();
        for (feature, support) in features.iter() {
            let required = support == FeatureSupport::Mandatory;
            if let Some(bit) = feature.bit(required) {
                flags.set(bit);
            }
        }
        flags
    }
}
