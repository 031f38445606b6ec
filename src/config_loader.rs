/// Config loader - host configuration from bubblebot.yaml.
///
/// The YAML is grouped by OS section (RaspberryPi, Ubuntu, macOS) and then by
/// hostname, the same layout the rest of the host tooling uses. Missing
/// required keys fail loudly.

use crate::axis::Positions;
use crate::profile::Profiles;
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const OS_SECTIONS: [&str; 3] = ["RaspberryPi", "Ubuntu", "macOS"];

/// Resolve the config path: explicit argument, then BUBBLEBOT_CONFIG from the
/// environment (.env honoured), then bubblebot.yaml next to Cargo.toml.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let _ = dotenv();
    env::var("BUBBLEBOT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("bubblebot.yaml"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PinMap {
    pub step_a: u32,
    pub dir_a: u32,
    pub step_b: u32,
    pub dir_b: u32,
    pub fan_pwm: Option<u32>,
}

impl Default for PinMap {
    fn default() -> Self {
        Self { step_a: 17, dir_a: 27, step_b: 22, dir_b: 23, fan_pwm: Some(18) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct InvertDirection {
    pub a: bool,
    pub b: bool,
}

impl Default for InvertDirection {
    fn default() -> Self {
        Self { a: false, b: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct FanSettings {
    pub pwm_hz: u32,
}

impl Default for FanSettings {
    fn default() -> Self {
        Self { pwm_hz: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SmokeSettings {
    /// Serial device of the ENTTEC-compatible DMX interface
    pub dmx_port: Option<String>,
    #[serde(default = "default_dmx_channel")]
    pub dmx_channel: u16,
    #[serde(default = "default_dmx_baud")]
    pub baud: u32,
}

fn default_dmx_channel() -> u16 {
    1
}

fn default_dmx_baud() -> u32 {
    57600
}

impl Default for SmokeSettings {
    fn default() -> Self {
        Self { dmx_port: None, dmx_channel: default_dmx_channel(), baud: default_dmx_baud() }
    }
}

/// Operator-tunable values, updatable at runtime through /update_config.
/// Keys keep the camelCase names the dashboard sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeSettings {
    pub dip_duration: f64,
    pub lift_duration: f64,
    pub blow_duration: f64,
    pub close_duration: f64,
    /// Fan duty cycle in percent
    pub fan_speed: f64,
    pub fan_enabled: bool,
    /// DMX level 0-255
    pub smoke_intensity: u8,
    pub smoke_duration: f64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            dip_duration: 5.0,
            lift_duration: 4.0,
            blow_duration: 3.0,
            close_duration: 1.5,
            fan_speed: 100.0,
            fan_enabled: true,
            smoke_intensity: 255,
            smoke_duration: 3.0,
        }
    }
}

impl RuntimeSettings {
    /// Merge a JSON object of updates. Unknown keys are ignored and returned.
    pub fn apply_update(&mut self, update: &serde_json::Value) -> Result<Vec<String>> {
        let update = update
            .as_object()
            .ok_or_else(|| anyhow!("config update must be a JSON object"))?;
        let mut merged = serde_json::to_value(&*self)?;
        let fields = merged
            .as_object_mut()
            .ok_or_else(|| anyhow!("runtime settings did not serialize to an object"))?;

        let mut ignored = Vec::new();
        for (key, value) in update {
            if fields.contains_key(key) {
                fields.insert(key.clone(), value.clone());
            } else {
                ignored.push(key.clone());
            }
        }

        let mut next: RuntimeSettings = serde_json::from_value(merged)
            .context("invalid value in config update")?;
        next.fan_speed = next.fan_speed.clamp(0.0, 100.0);
        *self = next;
        Ok(ignored)
    }

    pub fn blow_auto_stop(&self) -> Option<std::time::Duration> {
        (self.blow_duration > 0.0).then(|| std::time::Duration::from_secs_f64(self.blow_duration))
    }
}

/// Everything the daemon needs for one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct HostSettings {
    #[serde(default)]
    pub gpio_enabled: bool,
    /// Explicit gpiochip path; searched when absent
    pub gpio_chip: Option<String>,
    #[serde(default)]
    pub pins: PinMap,
    #[serde(default)]
    pub invert_direction: InvertDirection,
    pub travel_limit: i32,
    pub default_dip_offset: Positions,
    pub default_close_offset: Positions,
    #[serde(default = "default_open_tolerance")]
    pub open_tolerance: u32,
    pub positions_file: PathBuf,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub fan: FanSettings,
    #[serde(default)]
    pub smoke: SmokeSettings,
    #[serde(default)]
    pub profiles: Profiles,
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

fn default_open_tolerance() -> u32 {
    10
}

fn default_server_port() -> u16 {
    8080
}

impl HostSettings {
    /// Positions file resolved against the config file's directory
    pub fn positions_path(&self, config_path: &Path) -> PathBuf {
        if self.positions_file.is_absolute() {
            return self.positions_file.clone();
        }
        config_path
            .parent()
            .map(|dir| dir.join(&self.positions_file))
            .unwrap_or_else(|| self.positions_file.clone())
    }
}

/// Find the host block for `hostname` across the known OS sections.
fn find_host_block<'a>(yaml: &'a serde_yaml::Value, hostname: &str) -> Option<&'a serde_yaml::Value> {
    for os_key in OS_SECTIONS.iter() {
        if let Some(os_map) = yaml.get(*os_key).and_then(|v| v.as_mapping()) {
            for (k, v) in os_map.iter() {
                if k.as_str() == Some(hostname) {
                    return Some(v);
                }
            }
        }
    }
    None
}

pub fn parse_host_settings(yaml_text: &str, hostname: &str) -> Result<HostSettings> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(yaml_text)?;
    let block = find_host_block(&yaml, hostname)
        .ok_or_else(|| anyhow!("No host entry for '{}' in bubblebot.yaml", hostname))?;
    let settings: HostSettings = serde_yaml::from_value(block.clone())
        .with_context(|| format!("Invalid host entry for '{}'", hostname))?;

    if settings.travel_limit <= 0 {
        return Err(anyhow!("TRAVEL_LIMIT must be positive for '{}'", hostname));
    }
    settings
        .profiles
        .validate()
        .map_err(|e| anyhow!("PROFILES for '{}': {}", hostname, e))?;

    Ok(settings)
}

/// Load the host block for `hostname` from the YAML at `path`.
pub fn load_host_settings(path: &Path, hostname: &str) -> Result<HostSettings> {
    let text = fs::read_to_string(path)
        .map_err(|e| anyhow!("Missing required bubblebot.yaml at {:?}: {}", path, e))?;
    let settings = parse_host_settings(&text, hostname)?;
    log::info!(target: "config_loader", "Loaded host settings for '{}' from {:?} (gpio={}, port={})",
               hostname, path, settings.gpio_enabled, settings.server_port);
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SAMPLE: &str = r#"
RaspberryPi:
  bubblebot:
    GPIO_ENABLED: true
    PINS: {STEP_A: 5, DIR_A: 6, STEP_B: 13, DIR_B: 19}
    TRAVEL_LIMIT: 5000
    DEFAULT_DIP_OFFSET: {a: 200, b: -200}
    DEFAULT_CLOSE_OFFSET: {a: 400, b: -400}
    POSITIONS_FILE: positions.yaml
    PROFILES:
      toward_home: {base_step_delay_us: 900, ramp_up_steps: 20, slow_in_steps: 60}
      toward_dip: {base_step_delay_us: 1000}
      toward_close: {base_step_delay_us: 1000, ramp_up_steps: 40}
      jog: {base_step_delay_us: 2000, speed_multiplier: 0.5}
Ubuntu:
  devbox:
    TRAVEL_LIMIT: 1000
    DEFAULT_DIP_OFFSET: {a: 10, b: -10}
    DEFAULT_CLOSE_OFFSET: {a: 20, b: -20}
    POSITIONS_FILE: /tmp/bubblebot_positions.yaml
    SERVER_PORT: 9000
"#;

    #[test]
    fn test_parse_pi_host() {
        let s = parse_host_settings(SAMPLE, "bubblebot").unwrap();
        assert!(s.gpio_enabled);
        assert_eq!(s.pins.step_b, 13);
        assert_eq!(s.pins.fan_pwm, None);
        assert_eq!(s.default_dip_offset, Positions::new(200, -200));
        assert_eq!(s.profiles.toward_home.base_step_delay, Duration::from_micros(900));
        assert_eq!(s.profiles.jog.speed_multiplier, 0.5);
        assert_eq!(s.server_port, 8080);
        assert_eq!(s.open_tolerance, 10);
        assert!(s.invert_direction.b);
    }

    #[test]
    fn test_parse_defaults_for_dev_host() {
        let s = parse_host_settings(SAMPLE, "devbox").unwrap();
        assert!(!s.gpio_enabled);
        assert_eq!(s.server_port, 9000);
        assert_eq!(s.pins, PinMap::default());
        assert_eq!(s.runtime, RuntimeSettings::default());
        assert_eq!(s.positions_path(Path::new("/etc/bubblebot.yaml")), PathBuf::from("/tmp/bubblebot_positions.yaml"));
    }

    #[test]
    fn test_bundled_config_loads() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("bubblebot.yaml");
        let pi = load_host_settings(&path, "bubblebot").unwrap();
        assert_eq!(pi.pins, PinMap::default());
        assert_eq!(pi.smoke.dmx_port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(pi.runtime, RuntimeSettings::default());
        assert_eq!(pi.positions_path(&path), path.with_file_name("positions.yaml"));
        let mac = load_host_settings(&path, "studio-mac").unwrap();
        assert!(!mac.gpio_enabled);
        assert_eq!(mac.smoke.baud, 57600);
    }

    #[test]
    fn test_unknown_host_fails_loudly() {
        let err = parse_host_settings(SAMPLE, "nobody").unwrap_err();
        assert!(err.to_string().contains("No host entry"));
    }

    #[test]
    fn test_runtime_update_merges_known_keys() {
        let mut rt = RuntimeSettings::default();
        let ignored = rt
            .apply_update(&serde_json::json!({"fanSpeed": 140, "dipDuration": 2.5, "colour": "blue"}))
            .unwrap();
        assert_eq!(rt.fan_speed, 100.0);
        assert_eq!(rt.dip_duration, 2.5);
        assert_eq!(ignored, vec!["colour".to_string()]);
        assert!(rt.apply_update(&serde_json::json!({"fanEnabled": "yes"})).is_err());
        assert!(rt.fan_enabled);
    }
}
