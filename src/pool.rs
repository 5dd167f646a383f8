//! Fixed-capacity primitive arena.
//!
//! Slots are claimed in strictly increasing index order and never reused:
//! `Vacant → Live → Retired`.  The unconstrained parameters of every slot
//! live in one [`ParamBlock`] (row = slot index) so the optimiser can work on
//! whole groups at once.

use crate::types::{ParamBlock, ParamBounds, ParamGroup, PrimitiveParams, TopOptError};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Vacant,
    Live,
    Retired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimitivePool {
    params: ParamBlock,
    states: Vec<SlotState>,
    /// Created by the latest merge batch.
    recent: Vec<bool>,
    /// Index of the next slot to claim; every lower index has been used.
    marker: usize,
    bounds: ParamBounds,
}

impl PrimitivePool {
    pub fn new(capacity: usize, bounds: ParamBounds) -> Self {
        Self {
            params: ParamBlock::zeros(capacity, bounds.latent_dim()),
            states: vec![SlotState::Vacant; capacity],
            recent: vec![false; capacity],
            marker: 0,
            bounds,
        }
    }

    pub fn capacity(&self) -> usize {
        self.states.len()
    }

    pub fn marker(&self) -> usize {
        self.marker
    }

    pub fn bounds(&self) -> &ParamBounds {
        &self.bounds
    }

    pub fn params(&self) -> &ParamBlock {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParamBlock {
        &mut self.params
    }

    /// `None` for an index beyond the capacity.
    pub fn state(&self, slot: SlotId) -> Option<SlotState> {
        self.states.get(slot.0).copied()
    }

    pub fn is_live(&self, slot: SlotId) -> bool {
        self.states.get(slot.0) == Some(&SlotState::Live)
    }

    pub fn is_recent(&self, slot: SlotId) -> bool {
        self.recent.get(slot.0).copied().unwrap_or(false)
    }

    /// Live slots in index order.
    pub fn live_slots(&self) -> Vec<SlotId> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, &s)| s == SlotState::Live)
            .map(|(i, _)| SlotId(i))
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.states.iter().filter(|&&s| s == SlotState::Live).count()
    }

    pub fn recent_slots(&self) -> Vec<SlotId> {
        (0..self.capacity())
            .filter(|&i| self.recent[i] && self.states[i] == SlotState::Live)
            .map(SlotId)
            .collect()
    }

    pub fn live_mask(&self) -> Vec<bool> {
        self.states.iter().map(|&s| s == SlotState::Live).collect()
    }

    pub fn recent_mask(&self) -> Vec<bool> {
        self.recent
            .iter()
            .zip(&self.states)
            .map(|(&r, &s)| r && s == SlotState::Live)
            .collect()
    }

    /// Claim the next vacant slot and store `params` in it.
    pub fn claim(&mut self, params: &PrimitiveParams) -> Result<SlotId, TopOptError> {
        if self.marker >= self.capacity() {
            return Err(TopOptError::PoolExhausted { capacity: self.capacity() });
        }
        if params.shape_code.len() != self.bounds.latent_dim() {
            return Err(TopOptError::Shape(format!(
                "shape code has {} entries, pool expects {}",
                params.shape_code.len(),
                self.bounds.latent_dim()
            )));
        }
        let slot = SlotId(self.marker);
        self.encode_into(slot, params);
        self.states[slot.0] = SlotState::Live;
        self.marker += 1;
        Ok(slot)
    }

    /// Returns false if the slot was not live.
    pub fn retire(&mut self, slot: SlotId) -> bool {
        if !self.is_live(slot) {
            return false;
        }
        self.states[slot.0] = SlotState::Retired;
        self.recent[slot.0] = false;
        true
    }

    pub fn mark_recent(&mut self, slot: SlotId) {
        if let Some(flag) = self.recent.get_mut(slot.0) {
            *flag = true;
        }
    }

    pub fn clear_recent(&mut self) {
        self.recent.fill(false);
    }

    /// Bounded parameters of `slot`.
    pub fn decode(&self, slot: SlotId) -> PrimitiveParams {
        let i = slot.0;
        let b = &self.bounds;
        let w = &self.params;
        PrimitiveParams {
            offset: [
                b.offset[0].decode(w[ParamGroup::Offsets][[i, 0]]),
                b.offset[1].decode(w[ParamGroup::Offsets][[i, 1]]),
            ],
            scale: b.scale.decode(w[ParamGroup::Scale][[i, 0]]),
            rotation: b.rotation.decode(w[ParamGroup::Rotation][[i, 0]]),
            shape_code: b
                .shape_code
                .iter()
                .enumerate()
                .map(|(k, iv)| iv.decode(w[ParamGroup::ShapeCode][[i, k]]))
                .collect(),
        }
    }

    /// Overwrite the unconstrained parameters of `slot` with the logit of
    /// `params`.  Values on or outside a bound are pulled just inside.
    pub fn encode_into(&mut self, slot: SlotId, params: &PrimitiveParams) {
        let i = slot.0;
        let b = &self.bounds;
        let w = &mut self.params;
        for d in 0..2 {
            w[ParamGroup::Offsets][[i, d]] = b.offset[d].encode(params.offset[d]);
        }
        w[ParamGroup::Scale][[i, 0]] = b.scale.encode(params.scale);
        w[ParamGroup::Rotation][[i, 0]] = b.rotation.encode(params.rotation);
        for (k, iv) in b.shape_code.iter().enumerate() {
            w[ParamGroup::ShapeCode][[i, k]] = iv.encode(params.shape_code[k]);
        }
    }
}
