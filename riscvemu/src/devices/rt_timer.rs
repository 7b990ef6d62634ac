//! Real-time timer: ticks against the wall clock instead of instruction
//! count, at a programmable frequency between 1Hz and 1000Hz.
//!
//! Register layout (offsets from the device's base address):
//!
//! | Offset | Name      | Access | Description                          |
//! |--------|-----------|--------|---------------------------------------|
//! | 0x00   | counter   | R      | Number of ticks since last reset      |
//! | 0x04   | frequency | RW     | Ticks per second, clamped to 1..=1000 |
//! | 0x08   | control   | RW     | enable/one-shot/pending(W1C)/alarm     |
//! | 0x0c   | status    | R      | Read-only mirror of `control`         |
//! | 0x10   | compare   | RW     | Alarm-mode target count                |

use std::time::{Duration, Instant};

pub const REG_COUNTER: u32 = 0x00;
pub const REG_FREQUENCY: u32 = 0x04;
pub const REG_CONTROL: u32 = 0x08;
pub const REG_STATUS: u32 = 0x0c;
pub const REG_COMPARE: u32 = 0x10;

const CONTROL_ENABLE: u32 = 1 << 0;
const CONTROL_ONE_SHOT: u32 = 1 << 1;
const CONTROL_PENDING: u32 = 1 << 2;
const CONTROL_ALARM_MODE: u32 = 1 << 3;

const MIN_FREQUENCY_HZ: u32 = 1;
const MAX_FREQUENCY_HZ: u32 = 1000;
const DEFAULT_FREQUENCY_HZ: u32 = 100;

/// Wall-clock-driven interrupt source.
#[derive(Debug, Clone)]
pub struct RtTimer {
    counter: u32,
    compare: u32,
    frequency_hz: u32,
    enabled: bool,
    one_shot: bool,
    alarm_mode: bool,
    pending: bool,
    last_tick: Option<Instant>,
}

impl Default for RtTimer {
    fn default() -> Self {
        Self {
            counter: 0,
            compare: 0,
            frequency_hz: DEFAULT_FREQUENCY_HZ,
            enabled: false,
            one_shot: false,
            alarm_mode: false,
            pending: false,
            last_tick: None,
        }
    }
}

impl RtTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> bool {
        self.pending
    }

    fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frequency_hz as f64)
    }

    /// Advance against the wall clock. Called once per interpreter step;
    /// fires zero or more ticks depending on elapsed time since the last
    /// call, so a slow host never loses ticks outright (it just batches
    /// them up), and a fast host doesn't tick faster than `frequency_hz`.
    pub fn sample(&mut self, now: Instant) {
        if !self.enabled {
            return;
        }
        let period = self.period();
        let last = *self.last_tick.get_or_insert(now);
        if now.duration_since(last) < period {
            return;
        }
        self.last_tick = Some(last + period);
        self.counter = self.counter.wrapping_add(1);

        let fires = if self.alarm_mode {
            self.counter >= self.compare
        } else {
            true
        };
        if fires && !self.pending {
            self.pending = true;
            if self.alarm_mode {
                self.counter = 0;
            }
            if self.one_shot {
                self.enabled = false;
            }
        }
    }

    fn control_word(&self) -> u32 {
        (self.enabled as u32) * CONTROL_ENABLE
            | (self.one_shot as u32) * CONTROL_ONE_SHOT
            | (self.pending as u32) * CONTROL_PENDING
            | (self.alarm_mode as u32) * CONTROL_ALARM_MODE
    }

    fn write_control(&mut self, value: u32) {
        let enabling = value & CONTROL_ENABLE != 0 && !self.enabled;
        self.enabled = value & CONTROL_ENABLE != 0;
        self.one_shot = value & CONTROL_ONE_SHOT != 0;
        if value & CONTROL_PENDING != 0 {
            self.pending = false;
        }
        self.alarm_mode = value & CONTROL_ALARM_MODE != 0;
        if enabling {
            self.last_tick = None;
        }
    }

    pub fn read_register(&self, offset: u32) -> u32 {
        match offset {
            REG_COUNTER => self.counter,
            REG_FREQUENCY => self.frequency_hz,
            REG_CONTROL => self.control_word(),
            REG_STATUS => self.control_word(),
            REG_COMPARE => self.compare,
            _ => 0,
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u32) {
        match offset {
            REG_COUNTER => self.counter = value,
            REG_FREQUENCY => self.frequency_hz = value.clamp(MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ),
            REG_CONTROL => self.write_control(value),
            REG_STATUS => {}
            REG_COMPARE => self.compare = value,
            _ => {}
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_timer_never_ticks() {
        let mut timer = RtTimer::new();
        timer.sample(Instant::now());
        assert_eq!(timer.read_register(REG_COUNTER), 0);
    }

    #[test]
    fn frequency_write_is_clamped_to_range() {
        let mut timer = RtTimer::new();
        timer.write_register(REG_FREQUENCY, 0);
        assert_eq!(timer.read_register(REG_FREQUENCY), MIN_FREQUENCY_HZ);
        timer.write_register(REG_FREQUENCY, 5000);
        assert_eq!(timer.read_register(REG_FREQUENCY), MAX_FREQUENCY_HZ);
    }

    #[test]
    fn ticks_once_period_has_elapsed() {
        let mut timer = RtTimer::new();
        timer.write_register(REG_FREQUENCY, 1000);
        timer.write_register(REG_CONTROL, CONTROL_ENABLE);
        let start = Instant::now();
        timer.sample(start);
        assert_eq!(timer.read_register(REG_COUNTER), 0);
        timer.sample(start + Duration::from_millis(1));
        assert_eq!(timer.read_register(REG_COUNTER), 1);
        assert!(timer.pending());
    }

    #[test]
    fn alarm_mode_fires_only_at_compare() {
        let mut timer = RtTimer::new();
        timer.write_register(REG_FREQUENCY, 1000);
        timer.write_register(REG_COMPARE, 3);
        timer.write_register(REG_CONTROL, CONTROL_ENABLE | CONTROL_ALARM_MODE);
        let start = Instant::now();
        for n in 1..=3u32 {
            timer.sample(start + Duration::from_millis(n as u64));
        }
        assert!(timer.pending());
        assert_eq!(timer.read_register(REG_COUNTER), 0);
    }

    #[test]
    fn one_shot_disables_after_firing() {
        let mut timer = RtTimer::new();
        timer.write_register(REG_FREQUENCY, 1000);
        timer.write_register(REG_CONTROL, CONTROL_ENABLE | CONTROL_ONE_SHOT);
        let start = Instant::now();
        timer.sample(start + Duration::from_millis(1));
        assert!(timer.pending());
        assert_eq!(timer.read_register(REG_CONTROL) & CONTROL_ENABLE, 0);
    }
}
