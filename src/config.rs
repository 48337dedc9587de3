use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::ingest::CaptureConstraints;
use crate::session::{ReconnectPolicy, SessionConfig, DEFAULT_RECONNECT_DELAY};
use crate::transport::request::RequestConfig;
use crate::transport::stream::StreamConfig;
use crate::transport::TransportMode;

const DEFAULT_WS_URL: &str = "ws://127.0.0.1:5000/ws/camera";
const DEFAULT_API_URL: &str = "http://127.0.0.1:5000";
const DEFAULT_DEVICE: &str = "stub://camera";
const DEFAULT_TARGET_FPS: u32 = crate::scheduler::DEFAULT_TARGET_FPS;
const DEFAULT_JPEG_QUALITY: f32 = crate::frame::DEFAULT_JPEG_QUALITY;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_DEVICE_FPS: u32 = 30;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Path under the API root that accepts one frame per request.
pub const PROCESS_FRAME_PATH: &str = "/api/process_frame";

#[derive(Debug, Deserialize, Default)]
struct ClientConfigFile {
    service: Option<ServiceConfigFile>,
    capture: Option<CaptureConfigFile>,
    reconnect: Option<ReconnectConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServiceConfigFile {
    ws_url: Option<String>,
    api_url: Option<String>,
    transport: Option<TransportMode>,
    request_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    device: Option<String>,
    target_fps: Option<u32>,
    jpeg_quality: Option<f32>,
    width: Option<u32>,
    height: Option<u32>,
    frame_rate: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ReconnectConfigFile {
    delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub ws_url: String,
    pub api_url: String,
    pub transport: TransportMode,
    pub request_timeout: Duration,
    pub capture: CaptureSettings,
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    pub device: String,
    /// Capture ticks per second, independent of the device frame rate.
    pub target_fps: u32,
    pub jpeg_quality: f32,
    pub width: u32,
    pub height: u32,
    /// Frame rate requested from the device.
    pub frame_rate: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            transport: TransportMode::Stream,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            capture: CaptureSettings {
                device: DEFAULT_DEVICE.to_string(),
                target_fps: DEFAULT_TARGET_FPS,
                jpeg_quality: DEFAULT_JPEG_QUALITY,
                width: DEFAULT_WIDTH,
                height: DEFAULT_HEIGHT,
                frame_rate: DEFAULT_DEVICE_FPS,
            },
            reconnect: ReconnectPolicy::unbounded(DEFAULT_RECONNECT_DELAY),
        }
    }
}

impl ClientConfig {
    /// Defaults, then the file named by `SENTINEL_CONFIG`, then `SENTINEL_*`
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTINEL_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ClientConfigFile) -> Self {
        let defaults = Self::default();
        let service = file.service.unwrap_or_default();
        let capture = file.capture.unwrap_or_default();
        let reconnect = file.reconnect.unwrap_or_default();
        Self {
            ws_url: service.ws_url.unwrap_or(defaults.ws_url),
            api_url: service.api_url.unwrap_or(defaults.api_url),
            transport: service.transport.unwrap_or(defaults.transport),
            request_timeout: service
                .request_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            capture: CaptureSettings {
                device: capture.device.unwrap_or(defaults.capture.device),
                target_fps: capture.target_fps.unwrap_or(defaults.capture.target_fps),
                jpeg_quality: capture.jpeg_quality.unwrap_or(defaults.capture.jpeg_quality),
                width: capture.width.unwrap_or(defaults.capture.width),
                height: capture.height.unwrap_or(defaults.capture.height),
                frame_rate: capture.frame_rate.unwrap_or(defaults.capture.frame_rate),
            },
            reconnect: ReconnectPolicy {
                delay: reconnect
                    .delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.reconnect.delay),
                max_attempts: reconnect.max_attempts,
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_value("SENTINEL_WS_URL") {
            self.ws_url = url;
        }
        if let Some(url) = env_value("SENTINEL_API_URL") {
            self.api_url = url;
        }
        if let Some(mode) = env_value("SENTINEL_TRANSPORT") {
            self.transport = mode.parse()?;
        }
        if let Some(fps) = env_value("SENTINEL_TARGET_FPS") {
            self.capture.target_fps = fps
                .parse()
                .map_err(|_| anyhow!("SENTINEL_TARGET_FPS must be a positive integer"))?;
        }
        if let Some(quality) = env_value("SENTINEL_JPEG_QUALITY") {
            self.capture.jpeg_quality = quality
                .parse()
                .map_err(|_| anyhow!("SENTINEL_JPEG_QUALITY must be a number in (0, 1]"))?;
        }
        if let Some(device) = env_value("SENTINEL_DEVICE") {
            self.capture.device = device;
        }
        if let Some(delay) = env_value("SENTINEL_RECONNECT_DELAY_MS") {
            let millis: u64 = delay.parse().map_err(|_| {
                anyhow!("SENTINEL_RECONNECT_DELAY_MS must be an integer number of milliseconds")
            })?;
            self.reconnect.delay = Duration::from_millis(millis);
        }
        if let Some(max) = env_value("SENTINEL_RECONNECT_MAX_ATTEMPTS") {
            self.reconnect.max_attempts = Some(max.parse().map_err(|_| {
                anyhow!("SENTINEL_RECONNECT_MAX_ATTEMPTS must be a non-negative integer")
            })?);
        }
        Ok(())
    }

    /// Check ranges and URL schemes. Called again after CLI overrides.
    pub fn validate(&self) -> Result<()> {
        if self.capture.target_fps == 0 {
            return Err(anyhow!("target fps must be greater than zero"));
        }
        let quality = self.capture.jpeg_quality;
        if !(quality > 0.0 && quality <= 1.0) {
            return Err(anyhow!("jpeg quality must be in (0, 1], got {}", quality));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture width and height must be non-zero"));
        }
        if self.capture.device.trim().is_empty() {
            return Err(anyhow!("capture device must not be empty"));
        }
        check_scheme(&self.ws_url, &["ws", "wss"])?;
        check_scheme(&self.api_url, &["http", "https"])?;
        if self.request_timeout.is_zero() {
            return Err(anyhow!("request timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn frame_endpoint(&self) -> String {
        format!("{}{}", self.api_url.trim_end_matches('/'), PROCESS_FRAME_PATH)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            constraints: CaptureConstraints {
                ideal_width: self.capture.width,
                ideal_height: self.capture.height,
                ideal_frame_rate: self.capture.frame_rate,
            },
            target_fps: self.capture.target_fps,
            jpeg_quality: self.capture.jpeg_quality,
            reconnect: self.reconnect,
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            url: self.ws_url.clone(),
            io_timeout: self.request_timeout,
        }
    }

    pub fn request_config(&self) -> RequestConfig {
        RequestConfig {
            endpoint: self.frame_endpoint(),
            timeout: self.request_timeout,
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn check_scheme(raw: &str, allowed: &[&str]) -> Result<()> {
    let url = Url::parse(raw).map_err(|e| anyhow!("invalid url {}: {}", raw, e))?;
    if !allowed.contains(&url.scheme()) {
        return Err(anyhow!(
            "url {} must use one of: {}",
            raw,
            allowed.join(", ")
        ));
    }
    if url.host_str().is_none() {
        return Err(anyhow!("url {} has no host", raw));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<ClientConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg: ClientConfigFile = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
