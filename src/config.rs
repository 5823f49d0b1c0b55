use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use thiserror::Error;

use crate::delivery::DeliveryMode;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_MAX_SCALE_FACTOR: u32 = 16;
const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Error)]
#[error("invalid value {value:?} for {key}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

/// Runtime settings, read from the environment (and `.env`, if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    /// Where transient uploads live while a request is in flight.
    pub upload_dir: PathBuf,
    /// Linked artifacts; served under `/processed_images`.
    pub processed_dir: PathBuf,
    /// Streamed artifacts; removed once delivered.
    pub converted_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub max_scale_factor: u32,
    pub python_bin: String,
    pub upscale_script: PathBuf,
    pub remove_bg_script: PathBuf,
    pub convert_bin: String,
    /// `None` lets external commands run unbounded.
    pub process_timeout: Option<Duration>,
    /// Zero means unbounded.
    pub max_concurrent_jobs: usize,
    pub upscale_delivery: DeliveryMode,
    pub remove_bg_delivery: DeliveryMode,
    pub convert_delivery: DeliveryMode,
    pub public_base_url: Option<String>,
    pub trust_proxy: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            upload_dir: PathBuf::from("./uploads"),
            processed_dir: PathBuf::from("./processed_images"),
            converted_dir: PathBuf::from("./converted"),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_scale_factor: DEFAULT_MAX_SCALE_FACTOR,
            python_bin: "python3".to_string(),
            upscale_script: PathBuf::from("./express-python-api/upscale.py"),
            remove_bg_script: PathBuf::from("./express-python-api/removebg.py"),
            convert_bin: "convert".to_string(),
            process_timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            max_concurrent_jobs: 0,
            upscale_delivery: DeliveryMode::Link,
            remove_bg_delivery: DeliveryMode::Link,
            convert_delivery: DeliveryMode::Stream,
            public_base_url: None,
            trust_proxy: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup, falling back to defaults
    /// for every key the lookup does not know.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let host: IpAddr = parse_or(&get, "HOST", defaults.addr.ip())?;
        let port: u16 = parse_or(&get, "PORT", defaults.addr.port())?;
        let timeout_secs: u64 = parse_or(
            &get,
            "PROCESS_TIMEOUT_SECS",
            defaults.process_timeout.map_or(0, |t| t.as_secs()),
        )?;

        Ok(Self {
            addr: SocketAddr::new(host, port),
            upload_dir: get("UPLOAD_DIR").map_or(defaults.upload_dir, PathBuf::from),
            processed_dir: get("PROCESSED_DIR").map_or(defaults.processed_dir, PathBuf::from),
            converted_dir: get("CONVERTED_DIR").map_or(defaults.converted_dir, PathBuf::from),
            max_upload_bytes: parse_or(&get, "MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            max_scale_factor: parse_or(&get, "MAX_SCALE_FACTOR", defaults.max_scale_factor)?,
            python_bin: get("PYTHON_BIN").unwrap_or(defaults.python_bin),
            upscale_script: get("UPSCALE_SCRIPT").map_or(defaults.upscale_script, PathBuf::from),
            remove_bg_script: get("REMOVE_BG_SCRIPT")
                .map_or(defaults.remove_bg_script, PathBuf::from),
            convert_bin: get("CONVERT_BIN").unwrap_or(defaults.convert_bin),
            process_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            max_concurrent_jobs: parse_or(&get, "MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs)?,
            upscale_delivery: parse_or(&get, "UPSCALE_DELIVERY", defaults.upscale_delivery)?,
            remove_bg_delivery: parse_or(&get, "REMOVE_BG_DELIVERY", defaults.remove_bg_delivery)?,
            convert_delivery: parse_or(&get, "CONVERT_DELIVERY", defaults.convert_delivery)?,
            public_base_url: get("PUBLIC_BASE_URL")
                .map(|url| url.trim().trim_end_matches('/').to_string()),
            trust_proxy: parse_or(&get, "TRUST_PROXY", defaults.trust_proxy)?,
        })
    }

    /// Directory an artifact is written to, which depends on how it leaves.
    pub fn output_dir(&self, mode: DeliveryMode) -> &PathBuf {
        match mode {
            DeliveryMode::Link => &self.processed_dir,
            DeliveryMode::Stream => &self.converted_dir,
        }
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|err: T::Err| ConfigError {
            key,
            reason: err.to_string(),
            value,
        }),
    }
}
