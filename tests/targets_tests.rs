use portsweep::store::ResultMap;
use portsweep::targets::{resolve_targets, targets_from_map, OctetSweep};
use portsweep::types::Target;
use std::collections::HashSet;
use std::io::Write;

#[test]
fn sweep_contains_every_address_once() {
    let sweep = OctetSweep::parse("82.148.64-65.0-255").unwrap();
    let ips = sweep.expand();
    let unique: HashSet<_> = ips.iter().collect();
    assert_eq!(ips.len(), 512);
    assert_eq!(unique.len(), 512);
}

#[test]
fn host_file_mixes_forms() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    writeln!(f, "# targets\n192.168.7.0/29\nrouter.lan\n192.168.7.1").unwrap();
    let hosts = resolve_targets(f.path().to_str().unwrap()).unwrap();
    // /29 yields .1 through .6, the duplicate .1 is dropped
    assert_eq!(hosts.len(), 7);
    assert_eq!(hosts[6], Target::new("router.lan"));
}

#[test]
fn inline_spec_and_empty_spec() {
    assert_eq!(resolve_targets("10.0.0.1").unwrap(), vec![Target::new("10.0.0.1")]);
    assert!(resolve_targets("   ").is_err());
}

#[test]
fn map_targets_enumerate_each_host() {
    let mut map = ResultMap::new();
    map.record(&Target::new("10.0.0.2"), 22);
    map.record(&Target::new("10.0.0.1"), 80);
    map.record(&Target::new("10.0.0.1"), 443);
    assert_eq!(
        targets_from_map(&map),
        vec![Target::new("10.0.0.1"), Target::new("10.0.0.2")]
    );
}
