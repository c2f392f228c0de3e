use clap::Parser;
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use round_engine::{
    Account,
    EngineConfig,
    Variant,
};
use serde::Deserialize;
use std::{
    fs,
    path::PathBuf,
};
use url::Url;

pub const DEFAULT_LOG_DIR: &str = "~/.round-tui/logs";

#[derive(Parser, Debug)]
#[command(version, about = "Terminal dashboard for pool and lottery rounds", long_about = None)]
pub struct Args {
    /// Base URL of the JSON contract gateway
    #[arg(short, long)]
    pub gateway_url: Option<Url>,

    /// Address of the round contract
    #[arg(short, long)]
    pub contract: Option<String>,

    /// Local account used for reads and transactions
    #[arg(short, long)]
    pub account: Option<String>,

    #[arg(long)]
    pub variant: Option<Variant>,

    /// JSON settings file; command line flags take precedence
    #[arg(long)]
    pub config: Option<String>,

    #[arg(long)]
    pub log_dir: Option<String>,

    /// Never submit draws or distributions on expiry
    #[arg(long)]
    pub no_auto_act: bool,

    #[arg(long)]
    pub poll_interval_ms: Option<u64>,
}

/// Contents of the optional `--config` file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    gateway_url: Option<Url>,
    contract: Option<String>,
    account: Option<String>,
    log_dir: Option<String>,
    engine: EngineConfig,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub gateway_url: Url,
    pub contract: Account,
    pub account: Account,
    pub log_dir: PathBuf,
    pub engine: EngineConfig,
}

impl Settings {
    pub fn load(args: Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => read_file_settings(path)?,
            None => FileSettings::default(),
        };
        Self::merge(args, file)
    }

    fn merge(args: Args, file: FileSettings) -> Result<Self> {
        let gateway_url = args
            .gateway_url
            .or(file.gateway_url)
            .ok_or_else(|| eyre!("Specify --gateway-url or set `gateway_url` in the config file"))?;
        let contract = args
            .contract
            .or(file.contract)
            .ok_or_else(|| eyre!("Specify --contract or set `contract` in the config file"))?;
        let contract = Account::parse(&contract)
            .wrap_err_with(|| format!("invalid contract address `{contract}`"))?;
        let account = args
            .account
            .or(file.account)
            .ok_or_else(|| eyre!("Specify --account or set `account` in the config file"))?;
        let account = Account::parse(&account)
            .wrap_err_with(|| format!("invalid account address `{account}`"))?;

        let log_dir = args
            .log_dir
            .or(file.log_dir)
            .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string());
        let log_dir = PathBuf::from(
            shellexpand::full(&log_dir)
                .wrap_err("expanding log directory")?
                .into_owned(),
        );

        let mut engine = file.engine;
        if let Some(variant) = args.variant {
            engine.variant = variant;
        }
        if let Some(poll_interval_ms) = args.poll_interval_ms {
            engine.poll_interval_ms = poll_interval_ms;
        }
        if args.no_auto_act {
            engine.auto_act = false;
        }
        engine.validate().wrap_err("invalid engine settings")?;

        Ok(Self {
            gateway_url,
            contract,
            account,
            log_dir,
            engine,
        })
    }
}

fn read_file_settings(path: &str) -> Result<FileSettings> {
    let expanded = shellexpand::full(path)
        .wrap_err_with(|| format!("expanding config path {path}"))?;
    let raw = fs::read(expanded.as_ref())
        .wrap_err_with(|| format!("reading config file {expanded}"))?;
    serde_json::from_slice(&raw).wrap_err_with(|| format!("parsing config file {expanded}"))
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    const CONTRACT: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";
    const ACCOUNT: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["round-tui"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn merge__flags_only__uses_engine_defaults() {
        // given
        let args = args(&[
            "--gateway-url",
            "http://localhost:8545/",
            "--contract",
            CONTRACT,
            "--account",
            ACCOUNT,
        ]);

        // when
        let settings = Settings::merge(args, FileSettings::default()).unwrap();

        // then
        assert_eq!(settings.engine, EngineConfig::default());
        assert_eq!(settings.account.as_str(), ACCOUNT.to_lowercase());
        assert_eq!(settings.gateway_url.as_str(), "http://localhost:8545/");
    }

    #[test]
    fn merge__flags_and_file__flags_take_precedence() {
        // given
        let file: FileSettings = serde_json::from_str(&format!(
            r#"{{
                "gateway_url": "http://gateway.internal",
                "contract": "{CONTRACT}",
                "account": "{ACCOUNT}",
                "engine": {{ "variant": "pool", "poll_interval_ms": 5000, "settle_delay_ms": 200 }}
            }}"#
        ))
        .unwrap();
        let args = args(&[
            "--variant",
            "lottery",
            "--poll-interval-ms",
            "2000",
            "--no-auto-act",
        ]);

        // when
        let settings = Settings::merge(args, file).unwrap();

        // then
        assert_eq!(settings.engine.variant, Variant::Lottery);
        assert_eq!(settings.engine.poll_interval_ms, 2_000);
        assert_eq!(settings.engine.settle_delay_ms, 200);
        assert!(!settings.engine.auto_act);
        assert_eq!(settings.gateway_url.host_str(), Some("gateway.internal"));
    }

    #[test]
    fn merge__missing_account__is_an_error() {
        let args = args(&["--gateway-url", "http://localhost:8545", "--contract", CONTRACT]);

        let err = Settings::merge(args, FileSettings::default()).unwrap_err();

        assert!(err.to_string().contains("--account"));
    }

    #[test]
    fn merge__malformed_account__is_an_error() {
        let args = args(&[
            "--gateway-url",
            "http://localhost:8545",
            "--contract",
            CONTRACT,
            "--account",
            "0x1234",
        ]);

        assert!(Settings::merge(args, FileSettings::default()).is_err());
    }

    #[test]
    fn merge__zero_poll_interval__fails_validation() {
        let args = args(&[
            "--gateway-url",
            "http://localhost:8545",
            "--contract",
            CONTRACT,
            "--account",
            ACCOUNT,
            "--poll-interval-ms",
            "0",
        ]);

        let err = Settings::merge(args, FileSettings::default()).unwrap_err();

        assert!(format!("{err:#}").contains("poll_interval_ms"));
    }
}
