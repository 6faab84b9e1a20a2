use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Parse a port list into a deduplicated list of TCP ports (1..=65535).
///
/// Entries are separated by newlines or commas:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - comments: everything after `#` on a line is ignored
/// - whitespace and blank entries are ignored
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().unwrap_or("");

        for entry in line.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if let Some((a, b)) = entry.split_once('-') {
                let start = parse_port_str(a.trim())
                    .with_context(|| format!("line {line_no}: invalid start in range: {a}"))?;
                let end = parse_port_str(b.trim())
                    .with_context(|| format!("line {line_no}: invalid end in range: {b}"))?;
                if start > end {
                    bail!("line {line_no}: invalid range {start}-{end} (start > end)");
                }
                out.extend((start..=end).filter(|p| seen.insert(*p)));
                continue;
            }

            let p = parse_port_str(entry)
                .with_context(|| format!("line {line_no}: invalid port value: {entry}"))?;
            if seen.insert(p) {
                out.push(p);
            }
        }
    }

    Ok(out)
}

/// Load a port list from a file path. Errors if the file cannot be read or parsed.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> Result<Vec<u16>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    parse_ports_str(&content)
}

/// Interpret `spec` as a ports file if one exists at that path, otherwise as an inline list.
pub fn resolve_ports(spec: &str) -> Result<Vec<u16>> {
    let ports = if Path::new(spec).is_file() {
        load_ports_from_path(spec)?
    } else {
        parse_ports_str(spec)?
    };
    if ports.is_empty() {
        bail!("no ports to scan in {spec:?}");
    }
    Ok(ports)
}

/// Every port from `first` to `last`, both inclusive. Port 0 is never produced.
pub fn port_range(first: u16, last: u16) -> Vec<u16> {
    (first.max(1)..=last).collect()
}

/// Split ports into consecutive fixed-size batches; the final batch may be shorter.
pub fn batches(ports: &[u16], size: usize) -> Vec<Vec<u16>> {
    ports.chunks(size.max(1)).map(<[u16]>::to_vec).collect()
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_ports() {
        let input = "80\n22\n   443  \n";
        let ports = parse_ports_str(input).unwrap();
        assert_eq!(ports, vec![80, 22, 443]);
    }

    #[test]
    fn parse_comma_separated_inline() {
        let ports = parse_ports_str("1-3, 8080,2").unwrap();
        assert_eq!(ports, vec![1, 2, 3, 8080]);
    }

    #[test]
    fn parse_ranges_and_dedup() {
        let input = "8000-8002\n80\n8001\n";
        let ports = parse_ports_str(input).unwrap();
        assert_eq!(ports, vec![8000, 8001, 8002, 80]);
    }

    #[test]
    fn reversed_range_rejected() {
        assert!(parse_ports_str("90-80").is_err());
    }

    #[test]
    fn invalid_values_error() {
        assert!(parse_ports_str("70000\n").is_err());
        assert!(parse_ports_str("http").is_err());
    }

    #[test]
    fn port_range_skips_zero() {
        assert_eq!(port_range(0, 3), vec![1, 2, 3]);
        assert!(port_range(10, 9).is_empty());
    }

    #[test]
    fn batches_are_fixed_size_with_short_tail() {
        let ports = port_range(1, 2500);
        let b = batches(&ports, 1000);
        assert_eq!(b.len(), 3);
        assert_eq!(b[0].len(), 1000);
        assert_eq!(b[2].len(), 500);
        assert_eq!(b[1][0], 1001);
        assert_eq!(batches(&[1, 2], 0).len(), 2);
    }
}
