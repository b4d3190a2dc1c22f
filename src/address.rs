//! Parsing and formatting of `ads://` symbol addresses.
//!
//! An address names a PLC target, a symbol on that target and, optionally, the
//! rate at which the symbol should be polled:
//!
//! ```text
//! ads://<host>[:<port>][/@<poll_rate>]/<symbol>
//! ```
//!
//! The host is one of:
//! - `<ip>`: a bare IPv4 address. The AMS net id is assumed to be `<ip>.1.1`.
//! - `<ams_net_id>`: a six-octet AMS net id ending in `.1.1`. The IP address
//!   is assumed to be the first four octets.
//! - `<ams_net_id>@<ip>`: both given explicitly.
//!
//! The port is the AMS port of the runtime on the target (851 for the first
//! TwinCAT 3 PLC runtime). When no poll rate is given the symbol is monitored
//! with ADS device notifications instead of polling.
//!
//! ```
//! use adsars::address::{AddressDescriptor, DEFAULT_AMS_PORT};
//!
//! let addr: AddressDescriptor = "ads://172.21.148.1/Main.iCycle".parse().unwrap();
//! assert_eq!(addr.target.port, DEFAULT_AMS_PORT);
//! assert_eq!(addr.target.ams_net_id.to_string(), "172.21.148.1.1.1");
//! assert_eq!(addr.symbol_path, "Main.iCycle");
//! assert_eq!(addr.poll_rate, None);
//! ```

use std::{
    fmt::{self, Display},
    net::Ipv4Addr,
    str::FromStr,
    time::Duration,
};

use thiserror::Error;

/// The AMS port of the first TwinCAT 3 PLC runtime
pub const DEFAULT_AMS_PORT: u16 = 851;

const SCHEME: &str = "ads:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed ADS address {address:?}: {reason}")]
pub struct MalformedAddress {
    pub address: String,
    pub reason: String,
}

impl MalformedAddress {
    fn new(address: &str, reason: impl Into<String>) -> Self {
        MalformedAddress {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}

/// Six-octet logical address of an ADS device
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AmsNetId(pub [u8; 6]);

impl AmsNetId {
    /// The conventional net id for a host: its IP address followed by `.1.1`
    pub fn from_ip(ip: Ipv4Addr) -> Self {
        let [a, b, c, d] = ip.octets();
        AmsNetId([a, b, c, d, 1, 1])
    }

    /// The IP address this net id was derived from, if it follows the
    /// `<ip>.1.1` convention
    pub fn conventional_ip(&self) -> Option<Ipv4Addr> {
        match self.0 {
            [a, b, c, d, 1, 1] => Some(Ipv4Addr::new(a, b, c, d)),
            _ => None,
        }
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for AmsNetId {
    type Err = MalformedAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split('.');
        for octet in octets.iter_mut() {
            *octet = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| MalformedAddress::new(s, "AMS net id needs six numeric octets"))?;
        }
        if parts.next().is_some() {
            return Err(MalformedAddress::new(s, "AMS net id has more than six octets"));
        }
        Ok(AmsNetId(octets))
    }
}

impl Display for AmsNetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a}.{b}.{c}.{d}.{e}.{g}")
    }
}

/// A physical ADS endpoint: where to connect, and which runtime to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetDescriptor {
    pub ip_address: Ipv4Addr,
    pub ams_net_id: AmsNetId,
    pub port: u16,
}

impl TargetDescriptor {
    pub fn new(ip_address: Ipv4Addr, ams_net_id: AmsNetId, port: u16) -> Self {
        TargetDescriptor {
            ip_address,
            ams_net_id,
            port,
        }
    }

    /// Target on the default PLC port, using the conventional net id for `ip`
    pub fn from_ip(ip_address: Ipv4Addr) -> Self {
        Self::new(ip_address, AmsNetId::from_ip(ip_address), DEFAULT_AMS_PORT)
    }

    pub fn with_port(self, port: u16) -> Self {
        TargetDescriptor { port, ..self }
    }

    /// The host part of an address string for this target
    fn host(&self) -> String {
        if self.ams_net_id.conventional_ip() == Some(self.ip_address) {
            self.ip_address.to_string()
        } else {
            format!("{}@{}", self.ams_net_id, self.ip_address)
        }
    }

    fn parse_host(address: &str, host: &str, port: u16) -> Result<Self, MalformedAddress> {
        let parse_ip = |ip: &str| {
            ip.parse::<Ipv4Addr>()
                .map_err(|_| MalformedAddress::new(address, format!("Invalid IP address {ip:?}")))
        };
        let (ip_address, ams_net_id) = if let Some((ams, ip)) = host.split_once('@') {
            (parse_ip(ip)?, ams.parse::<AmsNetId>()?)
        } else {
            match host.matches('.').count() {
                3 => {
                    let ip = parse_ip(host)?;
                    (ip, AmsNetId::from_ip(ip))
                }
                5 => {
                    let ams: AmsNetId = host.parse()?;
                    let ip = ams.conventional_ip().ok_or_else(|| {
                        MalformedAddress::new(
                            address,
                            "Cannot assume IP address without an AMS net id that ends with .1.1",
                        )
                    })?;
                    (ip, ams)
                }
                _ => {
                    return Err(MalformedAddress::new(
                        address,
                        format!("Cannot parse host string {host:?}"),
                    ));
                }
            }
        };
        Ok(TargetDescriptor::new(ip_address, ams_net_id, port))
    }
}

impl Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host(), self.port)
    }
}

/// A fully resolved symbol address
#[derive(Debug, Clone, PartialEq)]
pub struct AddressDescriptor {
    pub target: TargetDescriptor,
    /// Dot-separated PLC variable path e.g. `Main.M1.bBrake`
    pub symbol_path: String,
    /// Seconds between polls. `None` means use device notifications.
    pub poll_rate: Option<f64>,
}

/// Fallback values used when an address is given as a bare symbol name
#[derive(Debug, Clone, Default)]
pub struct AddressDefaults {
    pub ip_address: Option<Ipv4Addr>,
    pub ams_net_id: Option<AmsNetId>,
    pub port: Option<u16>,
    pub poll_rate: Option<f64>,
}

impl AddressDescriptor {
    pub fn new(target: TargetDescriptor, symbol_path: &str, poll_rate: Option<f64>) -> Self {
        AddressDescriptor {
            target,
            symbol_path: symbol_path.to_string(),
            poll_rate,
        }
    }

    /// Parse either a full address, or a bare symbol name completed by `defaults`
    ///
    /// Anything present in a full address takes precedence over the defaults.
    pub fn with_defaults(
        address: &str,
        defaults: &AddressDefaults,
    ) -> Result<AddressDescriptor, MalformedAddress> {
        if let Some(rate) = defaults.poll_rate.filter(|r| poll_duration(*r).is_none()) {
            return Err(MalformedAddress::new(
                address,
                format!("Invalid default poll rate {rate}"),
            ));
        }
        if address.contains('/') {
            let mut parsed = parse(address)?;
            parsed.poll_rate = parsed.poll_rate.or(defaults.poll_rate);
            return Ok(parsed);
        }
        if address.is_empty() {
            return Err(MalformedAddress::new(address, "No symbol name given"));
        }
        let ip_address = defaults
            .ip_address
            .or_else(|| defaults.ams_net_id.and_then(|a| a.conventional_ip()))
            .ok_or_else(|| MalformedAddress::new(address, "IP address unset"))?;
        let ams_net_id = defaults
            .ams_net_id
            .unwrap_or_else(|| AmsNetId::from_ip(ip_address));
        Ok(AddressDescriptor {
            target: TargetDescriptor::new(
                ip_address,
                ams_net_id,
                defaults.port.unwrap_or(DEFAULT_AMS_PORT),
            ),
            symbol_path: address.to_string(),
            poll_rate: defaults.poll_rate,
        })
    }

    /// The poll interval, if this address asks for polling
    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_rate.and_then(poll_duration)
    }
}

impl FromStr for AddressDescriptor {
    type Err = MalformedAddress;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

impl Display for AddressDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format(&self.target, &self.symbol_path, self.poll_rate))
    }
}

/// The interval for a poll rate in seconds
///
/// `None` unless the rate is a positive duration that does not round down to
/// zero and fits in a [`Duration`].
pub fn poll_duration(rate: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(rate)
        .ok()
        .filter(|interval| !interval.is_zero())
}

/// Parse an `ads://` address string
pub fn parse(address: &str) -> Result<AddressDescriptor, MalformedAddress> {
    let Some(rest) = address.strip_prefix(SCHEME) else {
        return Err(MalformedAddress::new(address, "Address must start with ads://"));
    };
    let rest = rest.trim_start_matches('/');
    let (host_info, symbol) = rest.split_once('/').unwrap_or((rest, ""));

    let (host, port) = match host_info.split_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>().map_err(|_| {
                MalformedAddress::new(address, format!("Invalid port {port:?}"))
            })?,
        ),
        None => (host_info, DEFAULT_AMS_PORT),
    };
    let target = TargetDescriptor::parse_host(address, host, port)?;

    let (symbol, poll_rate) = match symbol.strip_prefix('@') {
        Some(poll_and_symbol) if poll_and_symbol.contains('/') => {
            let (poll_info, symbol) = poll_and_symbol.split_once('/').unwrap_or_default();
            let rate = poll_info
                .parse::<f64>()
                .ok()
                .filter(|r| poll_duration(*r).is_some())
                .ok_or_else(|| {
                    MalformedAddress::new(address, format!("Invalid poll rate {poll_info:?}"))
                })?;
            (symbol, Some(rate))
        }
        _ => (symbol, None),
    };

    if symbol.is_empty() {
        return Err(MalformedAddress::new(address, "No symbol name given"));
    }

    Ok(AddressDescriptor {
        target,
        symbol_path: symbol.to_string(),
        poll_rate,
    })
}

/// Build the address string for a symbol, omitting anything left at its default
pub fn format(target: &TargetDescriptor, symbol: &str, poll_rate: Option<f64>) -> String {
    let port_info = if target.port != DEFAULT_AMS_PORT {
        format!(":{}", target.port)
    } else {
        String::new()
    };
    let poll_info = poll_rate.map(|r| format!("/@{r}")).unwrap_or_default();
    format!("ads://{}{port_info}{poll_info}/{symbol}", target.host())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_ip() {
        let addr = parse("ads://172.21.148.1/Main.iCycle").unwrap();
        assert_eq!(addr.target.ip_address, Ipv4Addr::new(172, 21, 148, 1));
        assert_eq!(addr.target.ams_net_id, AmsNetId([172, 21, 148, 1, 1, 1]));
        assert_eq!(addr.target.port, 851);
        assert_eq!(addr.symbol_path, "Main.iCycle");
        assert_eq!(addr.poll_rate, None);
    }

    #[test]
    fn parse_explicit_everything() {
        let addr = parse("ads://172.21.148.1.1.1@172.21.148.1:801/@2.0/Main.x").unwrap();
        assert_eq!(addr.target.ams_net_id.to_string(), "172.21.148.1.1.1");
        assert_eq!(addr.target.ip_address.to_string(), "172.21.148.1");
        assert_eq!(addr.target.port, 801);
        assert_eq!(addr.poll_rate, Some(2.0));
        assert_eq!(addr.symbol_path, "Main.x");
        assert_eq!(addr.poll_interval(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn parse_ams_id_host() {
        let addr = parse("ads://10.0.0.5.1.1/GVL.fTemp").unwrap();
        assert_eq!(addr.target.ip_address, Ipv4Addr::new(10, 0, 0, 5));
        let mismatched = parse("ads://1.2.3.4.5.6/sym");
        assert!(mismatched.is_err());
    }

    #[test]
    fn parse_failures() {
        for bad in [
            "http://1.2.3.4/sym",
            "ads://1.2.3/sym",
            "ads://1.2.3.4.5/sym",
            "ads://1.2.3.4",
            "ads://1.2.3.4/",
            "ads://1.2.3.4:notaport/sym",
            "ads://1.2.3.4/@fast/sym",
            "ads://1.2.3.4/@-1/sym",
            "ads://1.2.3.4.1@1.2.3.4/sym",
        ] {
            assert!(parse(bad).is_err(), "Expected failure parsing {bad}");
        }
    }

    #[test]
    fn poll_rates_must_fit_a_duration() {
        for bad in [
            "ads://1.2.3.4/@1e30/MAIN.x",
            "ads://1.2.3.4/@1e-12/MAIN.x",
            "ads://1.2.3.4/@0/MAIN.x",
            "ads://1.2.3.4/@inf/MAIN.x",
            "ads://1.2.3.4/@NaN/MAIN.x",
        ] {
            assert!(parse(bad).is_err(), "Expected failure parsing {bad}");
        }
        assert_eq!(poll_duration(1e30), None);
        assert_eq!(poll_duration(1e-12), None);
        assert_eq!(poll_duration(0.001), Some(Duration::from_millis(1)));

        for rate in [1e30, 1e-12, -1.0] {
            let defaults = AddressDefaults {
                ip_address: Some(Ipv4Addr::new(10, 0, 0, 1)),
                poll_rate: Some(rate),
                ..Default::default()
            };
            assert!(AddressDescriptor::with_defaults("MAIN.x", &defaults).is_err());
            assert!(AddressDescriptor::with_defaults("ads://10.0.0.1/MAIN.x", &defaults).is_err());
        }
    }

    #[test]
    fn poll_marker_without_symbol_is_symbol() {
        // A leading @ with no following path component is not a poll rate
        let addr = parse("ads://1.2.3.4/@sym").unwrap();
        assert_eq!(addr.symbol_path, "@sym");
        assert_eq!(addr.poll_rate, None);
    }

    #[test]
    fn format_elides_defaults() {
        let target = TargetDescriptor::from_ip(Ipv4Addr::new(172, 21, 148, 1));
        assert_eq!(
            format(&target, "Main.iCycle", None),
            "ads://172.21.148.1/Main.iCycle"
        );
        let target = TargetDescriptor::new(
            Ipv4Addr::new(10, 1, 1, 1),
            AmsNetId([5, 6, 7, 8, 1, 1]),
            852,
        );
        assert_eq!(
            format(&target, "Main.x", Some(0.5)),
            "ads://5.6.7.8.1.1@10.1.1.1:852/@0.5/Main.x"
        );
    }

    #[test]
    fn round_trip() {
        for uri in [
            "ads://172.21.148.1/Main.iCycle",
            "ads://172.21.148.1.1.1@172.21.148.1:801/@2.0/Main.x",
            "ads://5.6.7.8.1.1@10.1.1.1:852/@0.25/GVL.arr",
            "ads://10.0.0.5.1.1/GVL.fTemp",
            "ads:10.0.0.5:851/GVL.fTemp",
        ] {
            let parsed = parse(uri).unwrap();
            let formatted = parsed.to_string();
            assert_eq!(parse(&formatted).unwrap(), parsed, "{uri} => {formatted}");
        }
    }

    #[test]
    fn bare_symbol_with_defaults() {
        let defaults = AddressDefaults {
            ip_address: Some(Ipv4Addr::new(172, 21, 148, 145)),
            poll_rate: Some(1.0),
            ..Default::default()
        };
        let addr = AddressDescriptor::with_defaults("Main.iCycle", &defaults).unwrap();
        assert_eq!(addr.target, TargetDescriptor::from_ip(Ipv4Addr::new(172, 21, 148, 145)));
        assert_eq!(addr.poll_rate, Some(1.0));

        let addr =
            AddressDescriptor::with_defaults("ads://1.2.3.4:852/Main.bBrake", &defaults).unwrap();
        assert_eq!(addr.target.port, 852);
        assert_eq!(addr.poll_rate, Some(1.0));

        assert!(AddressDescriptor::with_defaults("Main.x", &AddressDefaults::default()).is_err());
    }
}
