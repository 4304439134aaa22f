//! Shared helpers and protocol-wide constants.

use std::{
    fmt::{self, Display},
    sync::Once,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Conversion factor between whole coins and base units.
pub const COIN: u64 = 100_000_000;

/// Interval between iterations of the maintenance threads (deferred packet
/// retries, stale order scans, deposit watching).
#[cfg(feature = "integration-test")]
pub const HEART_BEAT_INTERVAL: Duration = Duration::from_millis(200);
/// Interval between iterations of the maintenance threads (deferred packet
/// retries, stale order scans, deposit watching).
#[cfg(not(feature = "integration-test"))]
pub const HEART_BEAT_INTERVAL: Duration = Duration::from_secs(3);

/// How many times a trader polls the counterparty-supplied pay txid before
/// falling back to scanning blocks for the deposit spend.
pub const MAX_OTHER_PAY_TX_TRIES: u32 = 5;

/// Orders on the facilitator that see no progress for this long get
/// cancelled with a timeout reason.
#[cfg(feature = "integration-test")]
pub const ORDER_SYNC_TIMEOUT: Duration = Duration::from_secs(10);
/// Orders on the facilitator that see no progress for this long get
/// cancelled with a timeout reason.
#[cfg(not(feature = "integration-test"))]
pub const ORDER_SYNC_TIMEOUT: Duration = Duration::from_secs(4 * 60);

/// Initializes the logger with sensible defaults.
///
/// Respects `RUST_LOG` when set. Safe to call more than once.
pub fn setup_logger(filter: log::LevelFilter) {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(filter.as_str()),
        )
        .format_timestamp_secs()
        .init();
    });
}

/// Current wall-clock time as UTC seconds.
pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A ticker symbol, fixed at eight zero-padded ASCII bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Currency([u8; 8]);

impl Currency {
    /// Builds a currency code from a ticker string.
    ///
    /// Returns `None` when the ticker is empty, longer than eight bytes, or
    /// contains non-printable characters.
    pub fn new(ticker: &str) -> Option<Self> {
        let bytes = ticker.as_bytes();
        if bytes.is_empty() || bytes.len() > 8 {
            return None;
        }
        if !bytes.iter().all(|b| b.is_ascii_graphic()) {
            return None;
        }
        let mut code = [0u8; 8];
        code[..bytes.len()].copy_from_slice(bytes);
        Some(Self(code))
    }

    /// Reads a currency code from its wire form. NUL padding is allowed only
    /// as a suffix.
    pub fn from_wire(bytes: [u8; 8]) -> Option<Self> {
        let len = bytes.iter().position(|b| *b == 0).unwrap_or(8);
        if bytes[len..].iter().any(|b| *b != 0) {
            return None;
        }
        let ticker = std::str::from_utf8(&bytes[..len]).ok()?;
        Self::new(ticker)
    }

    /// The eight-byte zero-padded wire form.
    pub fn to_wire(self) -> [u8; 8] {
        self.0
    }

    /// The ticker as a string slice.
    pub fn as_str(&self) -> &str {
        let len = self.0.iter().position(|b| *b == 0).unwrap_or(8);
        std::str::from_utf8(&self.0[..len]).unwrap_or_default()
    }
}

impl Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_round_trip() {
        let c = Currency::new("BTC").unwrap();
        assert_eq!(c.as_str(), "BTC");
        assert_eq!(c.to_wire(), *b"BTC\0\0\0\0\0");
        assert_eq!(Currency::from_wire(c.to_wire()), Some(c));
    }

    #[test]
    fn currency_rejects_bad_tickers() {
        assert!(Currency::new("").is_none());
        assert!(Currency::new("TOOLONGCODE").is_none());
        assert!(Currency::new("B C").is_none());
        // embedded NUL in padding
        assert!(Currency::from_wire(*b"BTC\0X\0\0\0").is_none());
    }

    #[test]
    fn eight_byte_ticker() {
        let c = Currency::new("ABCDEFGH").unwrap();
        assert_eq!(c.as_str(), "ABCDEFGH");
        assert_eq!(Currency::from_wire(c.to_wire()), Some(c));
    }
}
