// ABOUTME: Tests for configuration discovery through VKBOT_CONFIG_PATH
// ABOUTME: Verifies TOML sections land in the typed config and feed the API client settings

use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use vkbot_api::{Credentials, MeterMode};
use vkbot_core::Config;

fn clear_config_env_vars() {
    for var in [
        "VKBOT_CONFIG_PATH",
        "VK_TOKEN",
        "VK_LOGIN",
        "VK_USER_TOKEN",
        "VK_API_VERSION",
        "VKBOT_WORKSPACE",
        "VKBOT_RATE_WINDOW_MS",
        "VKBOT_RATE_MAX",
    ] {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_config_loads_from_env_path() {
    clear_config_env_vars();

    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("bot.toml");
    let config_content = r#"
[vk]
api_version = "5.92"
group_methods = ["wall.post"]
group_id = 77

[[vk.accounts]]
token = "group-token"

[[vk.accounts]]
login = "+70000000000"
user_token = "user-token"

[rate]
window_ms = 2000
max_per_window = 20
meter = "calls"

[longpoll]
wait = 20

[bot]
prefixes = ["."]
flood_interval_secs = 3
whitelist = [1, 2]
forward_messages = true
"#;
    let mut file = std::fs::File::create(&config_path).unwrap();
    file.write_all(config_content.as_bytes()).unwrap();
    std::env::set_var("VKBOT_CONFIG_PATH", config_path.to_str().unwrap());

    let config = Config::load().unwrap();

    assert_eq!(config.vk.api_version, "5.92");
    assert_eq!(config.vk.group_id, Some(77));
    assert!(config.bot.forward_messages);
    assert_eq!(config.vk.accounts.len(), 2);
    assert!(matches!(
        config.vk.accounts[0]
            .credentials(config.vk.app_id, config.vk.scope)
            .unwrap(),
        Credentials::Group { .. }
    ));
    assert!(matches!(
        config.vk.accounts[1]
            .credentials(config.vk.app_id, config.vk.scope)
            .unwrap(),
        Credentials::User(_)
    ));

    let settings = config.rate.client_settings();
    assert_eq!(settings.rate_window, Duration::from_millis(2000));
    assert_eq!(settings.rate_cap, 20);
    assert_eq!(settings.meter, MeterMode::Calls);

    assert_eq!(config.longpoll.wait, 20);
    assert_eq!(config.longpoll.mode, 10);
    assert_eq!(config.bot.prefixes, vec!["."]);
    assert_eq!(config.bot.flood_interval_secs, 3);
    assert_eq!(config.bot.whitelist, vec![1, 2]);
    assert_eq!(config.api.call_timeout(), Duration::from_secs(90));

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_env_path_to_missing_file_falls_back_to_env_only() {
    clear_config_env_vars();
    std::env::set_var("VKBOT_CONFIG_PATH", "/nonexistent/vkbot.toml");
    std::env::set_var("VK_TOKEN", "from-env");

    // ./config.toml or the XDG file may exist on a developer machine
    let config = Config::load().unwrap();
    assert!(config
        .vk
        .accounts
        .iter()
        .any(|a| a.token.as_deref() == Some("from-env")));

    clear_config_env_vars();
}
