use num::{FromPrimitive, traits::WrappingAdd};
use std::{
    env,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::warn;

use crate::address::AmsNetId;

/// Seconds between the Windows FILETIME epoch (1601-01-01) and the unix epoch
const FILETIME_UNIX_OFFSET_SECS: u64 = 11_644_473_600;

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + FromPrimitive + Copy>(value: &mut T) -> T {
    let id = *value;
    if let Some(one) = T::from_u8(1) {
        *value = value.wrapping_add(&one);
    }
    id
}

/// Convert a Windows FILETIME (100ns ticks since 1601) to a [`SystemTime`]
///
/// Times before the unix epoch are clamped to it.
pub(crate) fn filetime_to_system_time(filetime: u64) -> SystemTime {
    let since_1601 = Duration::from_nanos(filetime.saturating_mul(100));
    let since_unix = since_1601.saturating_sub(Duration::from_secs(FILETIME_UNIX_OFFSET_SECS));
    UNIX_EPOCH + since_unix
}

/// Get the ADS TCP port, either from environment or default 48898
pub fn get_default_tcp_port() -> u16 {
    env::var("ADS_TCP_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(48898u16)
}

/// Get the request timeout in seconds, either from environment or default 5
pub fn get_default_timeout() -> f32 {
    env::var("ADS_TIMEOUT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5.0f32)
        .max(0.1f32)
}

/// Get the AMS port we present as the source of requests, default 32905
pub fn get_default_source_port() -> u16 {
    env::var("ADS_SOURCE_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(32905u16)
}

/// Get an explicit source AMS net id from the environment, if set
///
/// When unset, sessions derive one from the local address of the TCP
/// connection.
pub fn get_default_source_net_id() -> Option<AmsNetId> {
    let value = env::var("ADS_SOURCE_NET_ID").ok()?;
    match value.parse() {
        Ok(net_id) => Some(net_id),
        Err(e) => {
            warn!("Ignoring invalid ADS_SOURCE_NET_ID: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inplace_add_wraps() {
        let mut id = u32::MAX;
        assert_eq!(wrapping_inplace_add(&mut id), u32::MAX);
        assert_eq!(id, 0);
        assert_eq!(wrapping_inplace_add(&mut id), 0);
        assert_eq!(id, 1);
    }

    #[test]
    fn filetime_conversion() {
        // 2020-01-01T00:00:00Z
        let filetime = 132_223_104_000_000_000u64;
        let expected = UNIX_EPOCH + Duration::from_secs(1_577_836_800);
        assert_eq!(filetime_to_system_time(filetime), expected);
        assert_eq!(filetime_to_system_time(0), UNIX_EPOCH);
    }
}
