//! # Channel State
//!
//! Lock-protected container for the 16 RC channel values and the armed flag.
//!
//! Every read and write happens under one acquisition of a single mutex, so
//! the transmitter never observes a half-applied channel set. The arm channel
//! (index 4) is owned by [`SafetyPolicy`](super::safety::SafetyPolicy) and is
//! rejected by [`ChannelState::set`].
//!
//! Mutations are only accepted while the state is active. The active flag
//! lives under the same lock as the channels, so a write can never land after
//! the failsafe values have been applied.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::crsf::encoder::clamp_channel_value;
use crate::crsf::protocol::{
    channels, RcChannels, CRSF_CHANNEL_VALUE_CENTER, CRSF_CHANNEL_VALUE_MIN, CRSF_NUM_CHANNELS,
};
use crate::error::{CrsfLinkError, Result};

/// Channel set a session starts with: throttle at minimum, everything else centered
pub fn safe_default_channels() -> RcChannels {
    let mut defaults = [CRSF_CHANNEL_VALUE_CENTER; CRSF_NUM_CHANNELS];
    defaults[channels::THROTTLE] = CRSF_CHANNEL_VALUE_MIN;
    defaults
}

#[derive(Debug, Clone, Copy)]
struct Inner {
    channels: RcChannels,
    armed: bool,
    active: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            channels: safe_default_channels(),
            armed: false,
            active: false,
        }
    }
}

/// Shared channel set with its armed flag
#[derive(Debug, Default)]
pub struct ChannelState {
    inner: Mutex<Inner>,
}

impl ChannelState {
    /// Create an inactive channel state holding the safe defaults, disarmed
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current channel values
    pub fn snapshot(&self) -> RcChannels {
        self.lock().channels
    }

    /// Cached arm state
    pub fn armed(&self) -> bool {
        self.lock().armed
    }

    /// Channels and arm state read under one lock acquisition
    pub fn status(&self) -> (RcChannels, bool) {
        let inner = self.lock();
        (inner.channels, inner.armed)
    }

    /// Whether mutations are currently accepted
    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Start accepting mutations
    pub fn activate(&self) {
        self.lock().active = true;
    }

    /// Set a single channel, clamping the value to 0-2047
    ///
    /// # Arguments
    ///
    /// * `index` - Channel index (0-15)
    /// * `value` - Raw channel value, clamped before storing
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `index` is outside 0-15 (`InvalidChannelIndex`)
    /// - `index` is the arm channel (`ReservedChannel`)
    /// - The state is not active (`NotConnected`)
    pub fn set(&self, index: usize, value: u16) -> Result<()> {
        if index >= CRSF_NUM_CHANNELS {
            return Err(CrsfLinkError::InvalidChannelIndex(index));
        }
        if index == channels::ARM {
            return Err(CrsfLinkError::ReservedChannel(index));
        }

        self.update_active(|ch, _| ch[index] = clamp_channel_value(value))
    }

    /// Replace the whole channel set
    ///
    /// Every value is clamped to 0-2047. The arm channel keeps its current
    /// value whatever the input carries at index 4.
    ///
    /// # Errors
    ///
    /// Returns `InvalidChannelCount` unless exactly 16 values are given, or
    /// `NotConnected` if the state is not active. Nothing is applied in either case.
    pub fn replace(&self, values: &[u16]) -> Result<()> {
        if values.len() != CRSF_NUM_CHANNELS {
            return Err(CrsfLinkError::InvalidChannelCount(values.len()));
        }

        self.update_active(|ch, _| {
            let arm_value = ch[channels::ARM];
            for (slot, &value) in ch.iter_mut().zip(values) {
                *slot = clamp_channel_value(value);
            }
            ch[channels::ARM] = arm_value;
        })
    }

    /// Return to the safe defaults, disarmed and inactive
    pub fn reset_to_defaults(&self) {
        *self.lock() = Inner::default();
    }

    /// Run `f` under a single lock if the state is active
    pub(crate) fn update_active<R>(
        &self,
        f: impl FnOnce(&mut RcChannels, &mut bool) -> R,
    ) -> Result<R> {
        let mut inner = self.lock();
        if !inner.active {
            return Err(CrsfLinkError::NotConnected);
        }
        let Inner { channels, armed, .. } = &mut *inner;
        Ok(f(channels, armed))
    }

    /// Deactivate, then run `f` under the same lock
    pub(crate) fn deactivate_with<R>(&self, f: impl FnOnce(&mut RcChannels, &mut bool) -> R) -> R {
        let mut inner = self.lock();
        inner.active = false;
        let Inner { channels, armed, .. } = &mut *inner;
        f(channels, armed)
    }
}
