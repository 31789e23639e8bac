use lmn_domain::config::Config;

#[test]
fn default_host_is_localhost() {
    let config = Config::default();
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 8000);
}

#[test]
fn explicit_server_section_parses() {
    let toml_str = r#"
[server]
host = "0.0.0.0"
port = 9123
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.server.port, 9123);
    assert_eq!(config.limits.llm, 1);
}

#[test]
fn limits_section_parses() {
    let toml_str = r#"
[limits]
llm = 2
embedding = -1
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.limits.llm, 2);
    assert_eq!(config.limits.embedding, -1);
    assert_eq!(config.limits.audio, 1);
}

#[test]
fn default_options_parse_per_recipe() {
    let toml_str = r#"
[default_options.llamacpp]
ctx_size = 4096
custom_args = "--mlock"
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    let opts = config.defaults_for(lmn_domain::model::Recipe::LlamaCpp);
    assert_eq!(opts.get_int("ctx_size"), Some(4096));
    assert_eq!(opts.get_str("custom_args"), Some("--mlock"));
}

#[test]
fn unknown_default_option_keys_are_dropped() {
    let toml_str = r#"
[default_options.llamacpp]
bogus = "x"
ctx_size = 2048
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    let opts = config.defaults_for(lmn_domain::model::Recipe::LlamaCpp);
    assert!(opts.get("bogus").is_none());
    assert_eq!(opts.get_int("ctx_size"), Some(2048));
}
