use super::*;
use std::time::Duration;

/// When and how often discovery beacons go out.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Schedule {
    /// The radio is always on; announce once at startup.
    AlwaysOn,
    /// One beacon every `cycle`.
    Periodic { cycle: Duration },
    /// Alternating on/off windows, each entry `timeslot`-sized slots
    /// long, starting with an on-window. Beacons go out at every
    /// window boundary and the duty-cycle hooks keep the radio up
    /// during on-windows.
    Pattern {
        on_off: Vec<u32>,
        timeslot: Duration,
    },
}

/// Hooks into the radio duty-cycling layer.
///
/// `radio_on` must bring the radio up and keep it up. After
/// `radio_off_allowed` the radio may idle off once nothing is pending:
/// no queued transmission, no transfer in flight. Implementations that
/// clear the neighbour list when going dark call
/// [`Discovery::clear`] themselves.
pub trait RadioDutyCycle: Send + Sync {
    fn radio_on(&self);
    fn radio_off_allowed(&self);
}

/// For always-on radios.
pub struct NullDutyCycle;

impl RadioDutyCycle for NullDutyCycle {
    fn radio_on(&self) {}
    fn radio_off_allowed(&self) {}
}

pub(super) fn start_with_rdc(
    discovery: Arc<Discovery>,
    schedule: Schedule,
    rdc: Arc<dyn RadioDutyCycle>,
) {
    tokio::spawn(async move {
        match schedule {
            Schedule::AlwaysOn => {
                rdc.radio_on();
                discovery.send_beacon().await;
            }
            Schedule::Periodic { cycle } => {
                rdc.radio_on();
                let mut interval = tokio::time::interval(cycle);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick fires immediately; announce at boot.
                loop {
                    interval.tick().await;
                    discovery.send_beacon().await;
                }
            }
            Schedule::Pattern { on_off, timeslot } => {
                if on_off.is_empty() {
                    warn!("Empty discovery pattern, radio stays on");
                    rdc.radio_on();
                    discovery.send_beacon().await;
                    return;
                }
                let mut on_window = true;
                loop {
                    for slots in &on_off {
                        if on_window {
                            rdc.radio_on();
                            discovery.send_beacon().await;
                        } else {
                            discovery.send_beacon().await;
                            rdc.radio_off_allowed();
                        }
                        tokio::time::sleep(timeslot * *slots).await;
                        on_window = !on_window;
                    }
                }
            }
        }
    });
}
