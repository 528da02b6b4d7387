#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Board clock and bus timing for the charger controller.

use core::ops::Add;
use core::time::Duration;

use charger_core::time::{ChargerInstant, Clock};
use embassy_time::Instant;

/// Car bus (BMS) bit rate.
pub const CAR_BUS_BITRATE: u32 = 500_000;
/// Power stage bus bit rate.
pub const STAGE_BUS_BITRATE: u32 = 250_000;

/// Charge request and charger state broadcast period on the car bus.
pub const CAR_BROADCAST_PERIOD: embassy_time::Duration = embassy_time::Duration::from_secs(1);
/// Control frame broadcast period on the stage bus.
pub const STAGE_BROADCAST_PERIOD: embassy_time::Duration =
    embassy_time::Duration::from_millis(100);
/// Pilot capture refresh period.
pub const PILOT_SAMPLE_PERIOD: embassy_time::Duration = embassy_time::Duration::from_millis(50);

/// Pilot capture timer counting frequency (TIM1 prescaled from the APB2 clock).
pub const PILOT_TIMER_HZ: u32 = 800_000;

/// Embassy instant adapted to the core's time traits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BoardInstant(Instant);

impl BoardInstant {
    #[must_use]
    pub fn now() -> Self {
        Self(Instant::now())
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0.as_millis()
    }
}

impl From<Instant> for BoardInstant {
    fn from(value: Instant) -> Self {
        Self(value)
    }
}

impl Add<Duration> for BoardInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        let micros = u64::try_from(rhs.as_micros()).unwrap_or(u64::MAX);
        Self(
            self.0
                .checked_add(embassy_time::Duration::from_micros(micros))
                .unwrap_or(Instant::MAX),
        )
    }
}

impl ChargerInstant for BoardInstant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.saturating_duration_since(earlier.0).as_micros())
    }
}

/// Monotonic clock backed by the embassy time driver.
#[derive(Copy, Clone, Debug, Default)]
pub struct BoardClock;

impl Clock for BoardClock {
    type Instant = BoardInstant;

    fn now(&self) -> BoardInstant {
        BoardInstant::now()
    }

    fn relax(&self) {
        #[cfg(target_os = "none")]
        cortex_m::asm::nop();
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}
