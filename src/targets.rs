use anyhow::{bail, Context, Result};
use ipnet::{IpNet, Ipv4Net};
use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::path::Path;

use crate::store::ResultMap;
use crate::types::Target;

/// Two fixed leading octets and an enumerable range for each of the last two,
/// e.g. `82.148.64-79.0-255`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OctetSweep {
    pub base: [u8; 2],
    pub third: RangeInclusive<u8>,
    pub fourth: RangeInclusive<u8>,
}

impl OctetSweep {
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 4 {
            bail!("expected four dot-separated octets in {s:?}");
        }
        let a = parse_octet(parts[0]).with_context(|| format!("first octet of {s:?}"))?;
        let b = parse_octet(parts[1]).with_context(|| format!("second octet of {s:?}"))?;
        let third = parse_octet_range(parts[2]).with_context(|| format!("third octet of {s:?}"))?;
        let fourth =
            parse_octet_range(parts[3]).with_context(|| format!("fourth octet of {s:?}"))?;
        Ok(Self {
            base: [a, b],
            third,
            fourth,
        })
    }

    /// All addresses in lexicographic order.
    pub fn expand(&self) -> Vec<Ipv4Addr> {
        let [a, b] = self.base;
        self.third
            .clone()
            .flat_map(|c| self.fourth.clone().map(move |d| Ipv4Addr::new(a, b, c, d)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.third.clone().count() * self.fourth.clone().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Expand a CIDR into its host addresses, excluding network and broadcast.
///
/// /31 and /32 blocks have no such reserved addresses and expand to every address they hold.
pub fn expand_cidr(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if net.prefix_len() >= 31 {
        return (start..=end).map(Ipv4Addr::from).collect();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}

/// Parse a host list into targets, each exactly once in first-seen order.
///
/// Entries are separated by newlines or commas and may be:
/// - an IPv4 address or hostname: `10.0.0.1`, `scanme.example`
/// - a CIDR block: `192.168.1.0/24`
/// - an octet sweep: `82.148.64-79.0-255`
///
/// Everything after `#` on a line is ignored.
pub fn parse_hosts_str(s: &str) -> Result<Vec<Target>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |t: Target| {
        if seen.insert(t.clone()) {
            out.push(t);
        }
    };

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().unwrap_or("");

        for entry in line.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if entry.contains('/') {
                let net = match entry.parse::<IpNet>() {
                    Ok(IpNet::V4(n)) => n.trunc(),
                    Ok(IpNet::V6(_)) => bail!("line {line_no}: IPv6 ranges are not scanned: {entry}"),
                    Err(e) => bail!("line {line_no}: invalid CIDR {entry}: {e}"),
                };
                expand_cidr(net)
                    .into_iter()
                    .for_each(|ip| push(Target::new(ip.to_string())));
            } else if entry.contains('-') && looks_like_sweep(entry) {
                let sweep =
                    OctetSweep::parse(entry).with_context(|| format!("line {line_no}"))?;
                sweep
                    .expand()
                    .into_iter()
                    .for_each(|ip| push(Target::new(ip.to_string())));
            } else {
                push(Target::new(entry));
            }
        }
    }

    Ok(out)
}

/// Load a host list from a file path.
pub fn load_hosts_from_path(path: impl AsRef<Path>) -> Result<Vec<Target>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read hosts file: {}", path.as_ref().display()))?;
    parse_hosts_str(&content)
}

/// Interpret `spec` as a hosts file if one exists at that path, otherwise as an inline list.
pub fn resolve_targets(spec: &str) -> Result<Vec<Target>> {
    let targets = if Path::new(spec).is_file() {
        load_hosts_from_path(spec)?
    } else {
        parse_hosts_str(spec)?
    };
    if targets.is_empty() {
        bail!("no targets to scan in {spec:?}");
    }
    Ok(targets)
}

/// The targets already present in a result map.
pub fn targets_from_map(map: &ResultMap) -> Vec<Target> {
    map.targets().cloned().collect()
}

// Hostnames may contain '-', sweeps are digits, dots and dashes only.
fn looks_like_sweep(entry: &str) -> bool {
    entry.split('.').count() == 4
        && entry
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == '-')
}

fn parse_octet(s: &str) -> Result<u8> {
    s.trim()
        .parse::<u8>()
        .map_err(|e| anyhow::anyhow!("invalid octet {s:?}: {e}"))
}

fn parse_octet_range(s: &str) -> Result<RangeInclusive<u8>> {
    match s.split_once('-') {
        Some((lo, hi)) => {
            let lo = parse_octet(lo)?;
            let hi = parse_octet(hi)?;
            if lo > hi {
                bail!("invalid range {lo}-{hi} (start > end)");
            }
            Ok(lo..=hi)
        }
        None => {
            let v = parse_octet(s)?;
            Ok(v..=v)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_matches_reference_range() {
        let sweep = OctetSweep::parse("82.148.64-79.0-255").unwrap();
        let ips = sweep.expand();
        assert_eq!(ips.len(), 16 * 256);
        assert_eq!(sweep.len(), ips.len());
        assert_eq!(ips[0], Ipv4Addr::new(82, 148, 64, 0));
        assert_eq!(ips[ips.len() - 1], Ipv4Addr::new(82, 148, 79, 255));
    }

    #[test]
    fn sweep_single_octets() {
        let sweep = OctetSweep::parse("10.0.0.1-3").unwrap();
        assert_eq!(
            sweep.expand(),
            vec![
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(10, 0, 0, 3)
            ]
        );
    }

    #[test]
    fn sweep_rejects_bad_input() {
        assert!(OctetSweep::parse("10.0.5-1.0").is_err());
        assert!(OctetSweep::parse("10.0.0").is_err());
        assert!(OctetSweep::parse("10.0.300.0").is_err());
    }

    #[test]
    fn expand_small_cidr_excludes_network_and_broadcast() {
        let net = Ipv4Net::new(Ipv4Addr::new(192, 168, 1, 0), 30).unwrap();
        assert_eq!(
            expand_cidr(net),
            vec![Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(192, 168, 1, 2)]
        );
    }

    #[test]
    fn expand_host_cidr_keeps_address() {
        let net = Ipv4Net::new(Ipv4Addr::new(10, 9, 8, 7), 32).unwrap();
        assert_eq!(expand_cidr(net), vec![Ipv4Addr::new(10, 9, 8, 7)]);
    }

    #[test]
    fn mixed_host_list_dedups() {
        let input = r#"
            # lab hosts
            10.0.0.1, db-1.internal
            10.0.0.0/30   # .1 and .2
            10.0.0.2-3
        "#;
        let hosts: Vec<String> = parse_hosts_str(input)
            .unwrap()
            .into_iter()
            .map(|t| t.to_string())
            .collect();
        assert_eq!(hosts, vec!["10.0.0.1", "db-1.internal", "10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn ipv6_cidr_rejected() {
        assert!(parse_hosts_str("fe80::/64").is_err());
    }
}
