use std::path::Path;

use fleet_domain::{AllocationStrategy, PurchasingOption};

#[test]
fn load_valid_fixture() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/config.json");
    let cfg = fleet_config::load(&path).expect("should load without error");

    assert_eq!(cfg.nodegroups.len(), 1);
    let ng = &cfg.nodegroups[0];
    assert_eq!(ng.partition_name.as_str(), "p1");
    assert_eq!(ng.nodegroup_name.as_str(), "ng1");
    assert_eq!(ng.purchasing_option, PurchasingOption::Spot);
    assert_eq!(ng.allocation_strategy, AllocationStrategy::LowestPrice);
    assert_eq!(cfg.slurm_bin_path.to_str().unwrap(), "/usr/bin/");
}

#[test]
fn missing_file_returns_error() {
    let path = Path::new("/nonexistent/path/does/not/exist.json");
    assert!(fleet_config::load(path).is_err());
}
