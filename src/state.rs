//! Charge/discharge state machine

use crate::afe::{Afe, Switch};
#[cfg(feature = "defmt")]
use crate::fmt::*;
use crate::status::{BmsState, BmsStatus};

/// Target state for the given permissions. Moves at most one path per step,
/// except when both paths have to go off at once.
pub fn next_state(state: BmsState, chg_allowed: bool, dis_allowed: bool) -> BmsState {
    match state {
        BmsState::Off => {
            if dis_allowed {
                BmsState::Dis
            } else if chg_allowed {
                BmsState::Chg
            } else {
                BmsState::Off
            }
        }
        BmsState::Chg => {
            if !chg_allowed {
                BmsState::Off
            } else if dis_allowed {
                BmsState::Normal
            } else {
                BmsState::Chg
            }
        }
        BmsState::Dis => {
            if !dis_allowed {
                BmsState::Off
            } else if chg_allowed {
                BmsState::Normal
            } else {
                BmsState::Dis
            }
        }
        BmsState::Normal => match (chg_allowed, dis_allowed) {
            (true, true) => BmsState::Normal,
            (true, false) => BmsState::Chg,
            (false, true) => BmsState::Dis,
            (false, false) => BmsState::Off,
        },
    }
}

pub struct StateMachine {
    /// Transitions are inhibited before this uptime (ms)
    ready_at_ms: u64,
}

impl StateMachine {
    pub const fn new(ready_at_ms: u64) -> Self {
        Self { ready_at_ms }
    }

    pub fn ready(&self, now_ms: u64) -> bool {
        now_ms >= self.ready_at_ms
    }

    /// Evaluates the transitions and drives the FETs accordingly. Switches are
    /// opened before others are closed. The state only changes after all switch
    /// commands went through, a failed command is repeated on the next call.
    pub async fn run<A, const N: usize>(
        &mut self,
        afe: &mut A,
        status: &mut BmsStatus<N>,
        now_ms: u64,
    ) -> Result<(), A::Error>
    where
        A: Afe<N>,
    {
        if !self.ready(now_ms) {
            return Ok(());
        }

        let current = status.state;
        let target = next_state(current, status.chg_allowed(), status.dis_allowed());

        if target == current {
            return Ok(());
        }

        if current.discharging() && !target.discharging() {
            afe.set_switch(Switch::Discharge, false).await?;
        }

        if current.charging() && !target.charging() {
            afe.set_switch(Switch::Charge, false).await?;
        }

        // measurements may have moved since the target was picked
        if target.discharging() && !current.discharging() {
            if !status.dis_allowed() {
                return Ok(());
            }
            afe.set_switch(Switch::Discharge, true).await?;
        }

        if target.charging() && !current.charging() {
            if !status.chg_allowed() {
                return Ok(());
            }
            afe.set_switch(Switch::Charge, true).await?;
        }

        info!("state {:?} -> {:?}", current, target);
        status.state = target;

        Ok(())
    }
}
