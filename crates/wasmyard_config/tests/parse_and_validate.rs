use wasmyard_config::YardConfig;

#[test]
fn test_parse_and_validate() {
    let config = YardConfig::load("tests/fixtures/basic.yaml").unwrap();
    assert_eq!(config.name, "basic");
    assert_eq!(config.server.address, "127.0.0.1");
    assert_eq!(config.server.port, 50610);
    assert_eq!(config.dealer.address, "127.0.0.1");
    assert_eq!(config.dealer.port, 50620);
    assert_eq!(config.runtime.name, "io.wasmyard.wasmtime.v1");
    assert_eq!(
        config.runtime.options.get("engine").map(String::as_str),
        Some("cranelift")
    );
    assert_eq!(config.dealer_endpoint(), "http://127.0.0.1:50620");
}

#[test]
fn test_relative_storage_paths_resolve_against_config_dir() {
    let config = YardConfig::load("tests/fixtures/relative_storage.yaml").unwrap();
    assert!(config.root_dir().ends_with("tests/fixtures/data/root"));
    assert!(config.state_dir().ends_with("tests/fixtures/data/state"));
    // module_dir defaults under root_dir when unset
    assert_eq!(config.module_dir(), config.root_dir().join("wasmmodules"));
}

#[test]
fn test_missing_runtime_name() {
    let err = YardConfig::load("tests/fixtures/no_runtime_name.yaml").unwrap_err();
    assert_eq!(err, "Runtime name must not be empty");
}

#[test]
fn test_empty_name() {
    let err = YardConfig::load("tests/fixtures/empty_name.yaml").unwrap_err();
    assert_eq!(err, "Name is required in the name field");
}
