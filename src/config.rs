//! Crate-level tunables threaded in by the facade at construction time.

use std::time::Duration;

use crate::l2cap::SecurityLevel;

/// Default ATT MTU before any MTU exchange has taken place.
pub const DEFAULT_MTU: u16 = 23;

/// Default discovery watchdog duration.
pub const DEFAULT_GATT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a [`Transport`](crate::transport::Transport) and the
/// discovery engine built on top of it.
///
/// There is no environment-variable or file-based configuration layer here;
/// like the comparable leaf modules this crate is built in the style of,
/// configuration is an explicit constructor argument.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// How long the discovery watchdog waits for the next arriving
    /// value/descriptor read before failing the discovery with
    /// [`ErrorKind::DiscoveryTimeout`](crate::ErrorKind::DiscoveryTimeout).
    pub gatt_timeout: Duration,
    /// Security level a freshly opened transport starts at.
    pub initial_security: SecurityLevel,
    /// Security level the escalator raises a transport to on
    /// `INSUFF_ENC`/`AUTHENTICATION` failures.
    pub escalated_security: SecurityLevel,
    /// ATT MTU assumed before any MTU exchange.
    pub default_mtu: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gatt_timeout: DEFAULT_GATT_TIMEOUT,
            initial_security: SecurityLevel::Low,
            escalated_security: SecurityLevel::High,
            default_mtu: DEFAULT_MTU,
        }
    }
}
