//! Host controller tunables
//!
//! Every bounded wait and retry budget used by the controller backends lives
//! here so an embedder can adjust them for slow hardware or for tests.

/// Timing and retry configuration shared by all controllers of a [`crate::UsbStack`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostConfig {
    /// Submission attempts per OHCI transfer before it is reported as failed
    pub ohci_retries: u32,
    /// OHCI root port reset: poll iterations
    pub ohci_reset_polls: u32,
    /// OHCI root port reset: interval between polls (ms)
    pub ohci_reset_interval_ms: u32,
    /// UHCI root port reset: poll iterations
    pub uhci_reset_polls: u32,
    /// UHCI root port reset: interval between polls (ms)
    pub uhci_reset_interval_ms: u32,
    /// EHCI root port reset: poll iterations after PR is released
    pub ehci_reset_polls: u32,
    /// EHCI root port reset: interval between polls (ms)
    pub ehci_reset_interval_ms: u32,
    /// Time PR is held asserted on an EHCI or UHCI root port (ms)
    pub port_reset_hold_ms: u32,
    /// Fixed delay before UHCI transaction descriptors are inspected (ms)
    pub uhci_settle_ms: u32,
    /// Poll iterations while waiting for a transfer to retire
    pub transfer_polls: u32,
    /// Interval between transfer polls (ms)
    pub transfer_poll_interval_ms: u32,
    /// Polls of 1 ms waiting for the controller to drop a timed-out list
    pub quiesce_polls: u32,
    /// OHCI SMM ownership change: poll iterations of 1 ms
    pub smm_handoff_polls: u32,
    /// EHCI BIOS handoff: poll iterations of 10 ms
    pub bios_handoff_polls: u32,
    /// Recovery time after SET_ADDRESS (ms)
    pub set_address_recovery_ms: u32,
    /// Lower bound for the root hub power-on-to-power-good wait (ms)
    pub power_wait_floor_ms: u32,
}

impl HostConfig {
    /// The timings the controllers are known to work with on real hardware.
    pub const fn new() -> Self {
        Self {
            ohci_retries: 3,
            ohci_reset_polls: 100,
            ohci_reset_interval_ms: 10,
            uhci_reset_polls: 20,
            uhci_reset_interval_ms: 20,
            ehci_reset_polls: 20,
            ehci_reset_interval_ms: 10,
            port_reset_hold_ms: 50,
            uhci_settle_ms: 20,
            transfer_polls: 500,
            transfer_poll_interval_ms: 1,
            quiesce_polls: 10,
            smm_handoff_polls: 1000,
            bios_handoff_polls: 100,
            set_address_recovery_ms: 2,
            power_wait_floor_ms: 20,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new()
    }
}
