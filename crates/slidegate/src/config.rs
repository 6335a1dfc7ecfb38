use std::{net::SocketAddr, ops::RangeInclusive, path::PathBuf, time::Duration};

use anyhow::Context;

use crate::supervisor::SupervisorConfig;
use crate::templates::{DEFAULT_DEV_ARGS, DEFAULT_DEV_COMMAND, DevServerTemplate};

const DEFAULT_LISTEN: &str = "0.0.0.0:3001";
const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 30000..=40000;
const DEFAULT_READY_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_STOP_GRACE_MS: u64 = 5_000;
const DEFAULT_IDLE_TTL_SEC: u64 = 30 * 60;
const DEFAULT_REAP_INTERVAL_SEC: u64 = 60;
const DEFAULT_PROJECTS_ROOT: &str = "./uploads";
pub const DEFAULT_PUBLIC_PREFIX: &str = "/api/slides/preview";

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parses `lo-hi` (inclusive). Ports below 1024 are refused.
pub fn parse_port_range(raw: &str) -> anyhow::Result<RangeInclusive<u16>> {
    let (lo, hi) = raw
        .split_once('-')
        .ok_or_else(|| anyhow::anyhow!("invalid port range (expected lo-hi): {raw}"))?;
    let lo: u16 = lo
        .trim()
        .parse()
        .with_context(|| format!("invalid port range start: {raw}"))?;
    let hi: u16 = hi
        .trim()
        .parse()
        .with_context(|| format!("invalid port range end: {raw}"))?;
    if lo < 1024 {
        anyhow::bail!("port range must start at 1024 or above: {raw}");
    }
    if lo > hi {
        anyhow::bail!("port range start exceeds end: {raw}");
    }
    Ok(lo..=hi)
}

fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub port_range: RangeInclusive<u16>,
    pub os_probe: bool,
    pub ready_timeout: Duration,
    pub stop_grace: Duration,
    pub idle_ttl: Duration,
    pub reap_interval: Duration,
    pub max_instances: Option<usize>,
    pub projects_root: PathBuf,
    pub projects_manifest: Option<PathBuf>,
    pub template: DevServerTemplate,
    pub public_prefix: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: ([0, 0, 0, 0], 3001).into(),
            port_range: DEFAULT_PORT_RANGE,
            os_probe: true,
            ready_timeout: Duration::from_millis(DEFAULT_READY_TIMEOUT_MS),
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
            idle_ttl: Duration::from_secs(DEFAULT_IDLE_TTL_SEC),
            reap_interval: Duration::from_secs(DEFAULT_REAP_INTERVAL_SEC),
            max_instances: None,
            projects_root: PathBuf::from(DEFAULT_PROJECTS_ROOT),
            projects_manifest: None,
            template: DevServerTemplate::default(),
            public_prefix: DEFAULT_PUBLIC_PREFIX.to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen = env_string("SLIDEGATE_LISTEN")
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string())
            .parse::<SocketAddr>()
            .context("invalid SLIDEGATE_LISTEN")?;

        let port_range = match env_string("SLIDEGATE_PORT_RANGE") {
            Some(raw) => parse_port_range(&raw)?,
            None => DEFAULT_PORT_RANGE,
        };

        let os_probe = env_string("SLIDEGATE_PORT_OS_PROBE")
            .and_then(|v| parse_bool(&v))
            .unwrap_or(true);

        let ready_timeout = Duration::from_millis(
            env_u64("SLIDEGATE_READY_TIMEOUT_MS")
                .map(|v| v.clamp(1000, 10 * 60 * 1000))
                .unwrap_or(DEFAULT_READY_TIMEOUT_MS),
        );
        let stop_grace = Duration::from_millis(
            env_u64("SLIDEGATE_STOP_GRACE_MS")
                .map(|v| v.clamp(100, 60_000))
                .unwrap_or(DEFAULT_STOP_GRACE_MS),
        );
        let idle_ttl = Duration::from_secs(
            env_u64("SLIDEGATE_IDLE_TTL_SEC")
                .map(|v| v.clamp(10, 24 * 60 * 60))
                .unwrap_or(DEFAULT_IDLE_TTL_SEC),
        );
        let reap_interval = Duration::from_secs(
            env_u64("SLIDEGATE_REAP_INTERVAL_SEC")
                .map(|v| v.clamp(1, 60 * 60))
                .unwrap_or(DEFAULT_REAP_INTERVAL_SEC),
        );
        let max_instances =
            env_u64("SLIDEGATE_MAX_INSTANCES").map(|v| v.clamp(1, 10_000) as usize);

        let projects_root = PathBuf::from(
            env_string("SLIDEGATE_PROJECTS_ROOT").unwrap_or_else(|| DEFAULT_PROJECTS_ROOT.into()),
        );
        let projects_manifest = env_string("SLIDEGATE_PROJECTS_MANIFEST").map(PathBuf::from);

        let template = DevServerTemplate::parse(
            &env_string("SLIDEGATE_DEV_COMMAND").unwrap_or_else(|| DEFAULT_DEV_COMMAND.into()),
            &env_string("SLIDEGATE_DEV_ARGS").unwrap_or_else(|| DEFAULT_DEV_ARGS.into()),
        )?;

        let public_prefix = normalize_prefix(
            &env_string("SLIDEGATE_PUBLIC_PREFIX")
                .unwrap_or_else(|| DEFAULT_PUBLIC_PREFIX.into()),
        );

        Ok(Self {
            listen,
            port_range,
            os_probe,
            ready_timeout,
            stop_grace,
            idle_ttl,
            reap_interval,
            max_instances,
            projects_root,
            projects_manifest,
            template,
            public_prefix,
        })
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            ready_timeout: self.ready_timeout,
            stop_grace: self.stop_grace,
            max_instances: self.max_instances,
        }
    }
}
