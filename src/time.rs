//! Bounded waits
//!
//! Every hardware wait in the controller drivers goes through these helpers so
//! that no loop can spin forever: each one carries an iteration budget and
//! reports [`UsbError::Timeout`] once it is exhausted. The sleeps inside are
//! the cooperative yield points of the init task.

use crate::drivers::usb::controller::UsbError;
use crate::platform::Platform;

/// Poll `condition` up to `max_iters` times, sleeping `interval_ms` between polls.
///
/// Returns the number of sleeps that were needed before the condition held.
/// On timeout exactly `max_iters` sleeps have been performed and the
/// condition has been evaluated `max_iters + 1` times.
pub fn wait_until<F>(
    platform: &dyn Platform,
    max_iters: u32,
    interval_ms: u32,
    mut condition: F,
) -> Result<u32, UsbError>
where
    F: FnMut() -> bool,
{
    for i in 0..max_iters {
        if condition() {
            return Ok(i);
        }
        platform.sleep_ms(interval_ms);
    }

    if condition() {
        Ok(max_iters)
    } else {
        Err(UsbError::Timeout)
    }
}

/// Same as [`wait_until`] but busy-waits `interval_us` microseconds between
/// polls instead of yielding.
pub fn spin_until<F>(
    platform: &dyn Platform,
    max_iters: u32,
    interval_us: u32,
    mut condition: F,
) -> Result<u32, UsbError>
where
    F: FnMut() -> bool,
{
    for i in 0..max_iters {
        if condition() {
            return Ok(i);
        }
        platform.delay_us(interval_us);
    }

    if condition() {
        Ok(max_iters)
    } else {
        Err(UsbError::Timeout)
    }
}
