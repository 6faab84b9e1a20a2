use portsweep::ports::{batches, parse_ports_str, port_range, resolve_ports};
use std::io::Write;

#[test]
fn parse_single_and_ranges_and_comments() {
    let input = r#"
        # common ports
        22
        80  # http
        443, 8000-8002
        8001  # duplicate
        # blank line follows

    "#;

    let ports = parse_ports_str(input).expect("parse ok");
    // Dedup, preserve order of first appearance
    assert_eq!(ports, vec![22, 80, 443, 8000, 8001, 8002]);
}

#[test]
fn invalid_port_rejected() {
    let input = "0\n"; // invalid: out of range
    assert!(parse_ports_str(input).is_err());
}

#[test]
fn resolve_reads_file_or_inline() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    writeln!(f, "21-23\n# ssh and friends").unwrap();
    assert_eq!(resolve_ports(f.path().to_str().unwrap()).unwrap(), vec![21, 22, 23]);
    assert_eq!(resolve_ports("443").unwrap(), vec![443]);
    assert!(resolve_ports("# nothing").is_err());
}

#[test]
fn full_range_partitions_into_checkpoint_batches() {
    let all = port_range(1, 65535);
    let b = batches(&all, 1000);
    assert_eq!(b.len(), 66);
    assert_eq!(b.iter().map(Vec::len).sum::<usize>(), 65535);
    assert_eq!(b.last().unwrap(), &(65001..=65535).collect::<Vec<u16>>());
}
