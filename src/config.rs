use std::path::PathBuf;

use anyhow::Result;
use serde::Deserialize;

/// Runtime configuration, loaded from a JSON file.
///
/// The deployed files use upper-case keys (`BROKER_IP`, ...); the config
/// crate folds keys case-insensitively, so they land on the snake_case
/// fields below.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// MQTT broker address
    pub broker_ip: String,
    pub broker_port: u16,
    /// machine identity, used as the MQTT topic segment
    pub machine_id: String,
    /// terminal identity registered with the payment gateway
    pub terminal_id: String,
    #[serde(default = "default_serial_port")]
    pub serial_port: String,
    #[serde(default = "default_payment_host")]
    pub payment_host: String,
    #[serde(default = "default_payment_port")]
    pub payment_port: u16,
    /// ISO 4217 numeric currency for purchases
    #[serde(default = "default_currency_code")]
    pub currency_code: String,
    /// where the catalogue and sales journal live
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_owned()
}

fn default_payment_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_payment_port() -> u16 {
    23001
}

fn default_currency_code() -> String {
    "840".to_owned()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

pub async fn open(path: PathBuf) -> Result<Config> {
    let config_file = tokio::fs::read_to_string(path).await?;
    let settings = config::Config::builder()
        .add_source(config::File::from_str(
            &config_file,
            config::FileFormat::Json,
        ))
        .build()?
        .try_deserialize()?;
    Ok(settings)
}

#[cfg(test)]
#[test]
fn load_example_config() {
    let settings = config::Config::builder()
        .add_source(config::File::from_str(
            include_str!("../config.example.json"),
            config::FileFormat::Json,
        ))
        .build()
        .unwrap()
        .try_deserialize::<Config>()
        .unwrap();
    assert_eq!(settings.broker_port, 1883);
    assert_eq!(settings.machine_id, "VM001");
    assert_eq!(settings.payment_port, 23001);
    assert_eq!(settings.currency_code, "840");
}
