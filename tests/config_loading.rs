//! Loader behavior through the driver: files, parameters, flat output.

use std::collections::HashMap;
use std::fs;

use weft::driver::{self, ConfigSource, DriverOptions};

#[test]
fn test_file_load_with_parameters_and_flat_output() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("shaper.weft");
    fs::write(
        &config,
        "require(weft);\n\
         define($cap 64);\n\
         src :: InfiniteSource(LENGTH $len);\n\
         src -> q :: Queue($cap) -> Unqueue -> Discard;\n",
    )
    .unwrap();

    let flat_path = dir.path().join("flat.weft");
    let mut opts = DriverOptions::new(ConfigSource::File(config));
    opts.quit = true;
    opts.output = Some(flat_path.clone());
    // command-line parameters fill $len
    opts.defines = HashMap::from([("len".to_string(), "256".to_string())]);
    assert_eq!(driver::run(opts).unwrap(), 0);

    let flat = fs::read_to_string(&flat_path).unwrap();
    assert!(flat.contains("require(weft);"));
    assert!(flat.contains("src :: InfiniteSource(LENGTH 256);"));
    assert!(flat.contains("q :: Queue(64);"));
    assert!(flat.contains("[0] -> [0]"));

    // the flat form is a fixed point: loading it and flattening again
    // reproduces it byte for byte
    let reflat_path = dir.path().join("reflat.weft");
    let mut opts = DriverOptions::new(ConfigSource::File(flat_path.clone()));
    opts.quit = true;
    opts.output = Some(reflat_path.clone());
    assert_eq!(driver::run(opts).unwrap(), 0);
    assert_eq!(fs::read_to_string(&reflat_path).unwrap(), flat);
}

#[test]
fn test_undefined_parameter_fails_the_load() {
    let opts = DriverOptions::new(ConfigSource::Expr(
        "src :: InfiniteSource(LENGTH $missing); src -> Discard;".to_string(),
    ));
    assert!(driver::run(opts).is_err());
}

#[test]
fn test_unsatisfied_requirement_fails_the_load() {
    let opts = DriverOptions::new(ConfigSource::Expr(
        "require(kernel); Idle;".to_string(),
    ));
    assert!(driver::run(opts).is_err());
}

#[test]
fn test_missing_file_is_an_error() {
    let opts = DriverOptions::new(ConfigSource::File("does/not/exist.weft".into()));
    assert!(driver::run(opts).is_err());
}
