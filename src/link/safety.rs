//! # Safety Policy
//!
//! Sole owner of the arm channel (index 4) and the failsafe shutdown values.

use std::sync::Arc;

use tracing::info;

use super::state::ChannelState;
use crate::crsf::protocol::{
    channels, RcChannels, CRSF_CHANNEL_VALUE_CENTER, CRSF_CHANNEL_VALUE_MAX, CRSF_CHANNEL_VALUE_MIN,
};
use crate::error::Result;

/// Arm, disarm and failsafe transitions over a shared [`ChannelState`]
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    state: Arc<ChannelState>,
}

impl SafetyPolicy {
    pub fn new(state: Arc<ChannelState>) -> Self {
        Self { state }
    }

    /// Set the arm channel high (2047) and mark the link armed
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` if the channel state is not active
    pub fn arm(&self) -> Result<()> {
        self.state.update_active(|ch, armed| {
            ch[channels::ARM] = CRSF_CHANNEL_VALUE_MAX;
            *armed = true;
        })?;
        info!("Armed");
        Ok(())
    }

    /// Center the arm channel (1024) and clear the armed flag
    ///
    /// Throttle is left untouched.
    pub fn disarm(&self) -> Result<()> {
        self.state.update_active(disarm_channels)?;
        info!("Disarmed");
        Ok(())
    }

    /// Center roll, pitch and yaw; throttle and arm state are left as they are
    pub fn reset_controls(&self) -> Result<()> {
        self.state.update_active(|ch, _| {
            ch[channels::ROLL] = CRSF_CHANNEL_VALUE_CENTER;
            ch[channels::PITCH] = CRSF_CHANNEL_VALUE_CENTER;
            ch[channels::YAW] = CRSF_CHANNEL_VALUE_CENTER;
        })
    }

    /// Drop throttle to zero, disarm, and return the resulting channel set
    ///
    /// The returned snapshot is the final frame of a session. It always has
    /// throttle at 0 and the arm channel at 1024, whatever the prior state.
    /// The channel state is deactivated under the same lock, so no command
    /// can change the set afterwards.
    pub fn shutdown_sequence(&self) -> RcChannels {
        let snapshot = self.state.deactivate_with(|ch, armed| {
            ch[channels::THROTTLE] = CRSF_CHANNEL_VALUE_MIN;
            disarm_channels(ch, armed);
            *ch
        });
        info!("Failsafe applied: throttle 0, disarmed");
        snapshot
    }
}

fn disarm_channels(ch: &mut RcChannels, armed: &mut bool) {
    ch[channels::ARM] = CRSF_CHANNEL_VALUE_CENTER;
    *armed = false;
}
