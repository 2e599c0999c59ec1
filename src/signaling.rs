//! Signaling capability seam.
//!
//! Hole punching needs a pre-existing channel to swap candidates, and that
//! channel usually comes from the relay client, but the two components are
//! conceptual peers. The coordinator therefore depends on this narrow trait
//! and the relay client is merely one injected provider of it. Tests supply
//! in-process implementations.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::nat::NatClass;

/// Externally observed candidates one side offers for punching. Raw local
/// listen addresses are never offered; they are usually private-range and
/// useless to the far side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunchOffer {
    pub candidates: Vec<String>,
    pub nat_class: NatClass,
}

/// The far side's counter-offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunchAnswer {
    pub candidates: Vec<String>,
    pub nat_class: NatClass,
}

/// An established coordination channel to a peer that is reachable out of
/// band (most commonly through the configured relay).
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Swap punch candidates with `target`. The far side is expected to
    /// begin its own probe burst as part of answering.
    async fn exchange_candidates(&self, target: Identity, offer: PunchOffer)
    -> Result<PunchAnswer>;
}
