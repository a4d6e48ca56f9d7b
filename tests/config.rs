use keyrate::config::KeyrateConfig;

const CONFIG: &str = r#"
registry:
  capacity: 128
policies:
  rules:
    - prefix: "user:"
      rate: unlimited
      burst: 5
"#;

// Environment variables are process-wide, so this binary holds a single test.
#[test]
fn test_environment_overrides_file() {
    let path = std::env::temp_dir().join(format!("keyrate-env-{}.yaml", std::process::id()));
    std::fs::write(&path, CONFIG).unwrap();

    std::env::set_var("KEYRATE__REGISTRY__CAPACITY", "64");
    let loaded = KeyrateConfig::from_file(&path);
    std::env::remove_var("KEYRATE__REGISTRY__CAPACITY");
    std::fs::remove_file(&path).unwrap();

    let config = loaded.unwrap();
    assert_eq!(config.registry.capacity, 64);
    assert_eq!(config.registry.build().unwrap().capacity(), 64);

    // Values the environment does not touch still come from the file.
    let policy = config.policies.resolve("user:42");
    assert!(policy.rate.is_infinite());
    assert_eq!(policy.burst, 5);
}
