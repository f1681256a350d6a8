use std::{fmt::Debug, net::SocketAddr, time::Duration};

use anyhow::{anyhow, Result};
use blob_store::BlobStorageConfig;
use data_model::{Machine, CONTAINER_RESOURCE};
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorKind {
    Minimal,
    #[default]
    FairShare,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FfmpegConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerConfig {
    /// Host put into the base URL of spawned containers.
    pub advertise_host: String,
    pub startup_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            advertise_host: "127.0.0.1".to_string(),
            startup_timeout_secs: 30,
            shutdown_grace_secs: 5,
        }
    }
}

impl ContainerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecConfig {
    /// Concurrent slices per execution stream.
    pub per_iter: usize,
    /// Frames per sampled slice.
    pub slice_length: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            per_iter: 4,
            slice_length: 250,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TracingExporter {
    Otlp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enable_metrics: bool,
    /// OTLP collector endpoint; the exporter default when unset.
    pub endpoint: Option<String>,
    pub tracing_exporter: Option<TracingExporter>,
    #[serde(with = "duration_secs")]
    pub metrics_interval: Duration,
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            tracing_exporter: None,
            metrics_interval: Duration::from_secs(10),
            instance_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub env: String,
    /// Address of the machine server.
    pub listen_addr: String,
    pub machines: Vec<Machine>,
    pub allocator: AllocatorKind,
    pub blob_storage: BlobStorageConfig,
    pub ffmpeg: FfmpegConfig,
    pub container: ContainerConfig,
    pub exec: ExecConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            env: "local".to_string(),
            listen_addr: "0.0.0.0:8081".to_string(),
            machines: vec![Machine {
                base_url: "http://127.0.0.1:8081".to_string(),
                resources: [(CONTAINER_RESOURCE.to_string(), 4)].into(),
            }],
            allocator: AllocatorKind::default(),
            blob_storage: Default::default(),
            ffmpeg: Default::default(),
            container: Default::default(),
            exec: Default::default(),
            telemetry: Default::default(),
        }
    }
}

impl Config {
    pub fn from_path(path: &str) -> Result<Config> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("unable to read config {}: {}", path, e))?;
        let config: Config = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        for machine in &self.machines {
            if machine.resources.get(CONTAINER_RESOURCE).copied().unwrap_or(0) <= 0 {
                return Err(anyhow!(
                    "machine {} must declare a positive {} resource",
                    machine.base_url,
                    CONTAINER_RESOURCE
                ));
            }
        }
        if self.exec.per_iter == 0 {
            return Err(anyhow!("exec.per_iter must be positive"));
        }
        if self.exec.slice_length == 0 {
            return Err(anyhow!("exec.slice_length must be positive"));
        }
        if self.ffmpeg.ffmpeg_path.is_empty() || self.ffmpeg.ffprobe_path.is_empty() {
            return Err(anyhow!("ffmpeg and ffprobe paths must be set"));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != "local"
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, std::process::id()))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_config_from_yaml() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            r#"
env: prod
listen_addr: 0.0.0.0:9000
allocator: minimal
machines:
  - base_url: http://10.0.0.2:9000
    resources:
      container: 8
      gpu: 2
exec:
  per_iter: 2
telemetry:
  enable_metrics: true
  metrics_interval: 30
"#
        )?;
        let config = Config::from_path(file.path().to_str().unwrap())?;
        assert_eq!(config.allocator, AllocatorKind::Minimal);
        assert_eq!(config.machines[0].resources["gpu"], 2);
        assert_eq!(config.exec.per_iter, 2);
        assert_eq!(config.exec.slice_length, 250);
        assert_eq!(config.telemetry.metrics_interval, Duration::from_secs(30));
        assert!(config.structured_logging());
        Ok(())
    }

    #[test]
    fn test_validate() {
        struct Case {
            description: &'static str,
            mutate: fn(&mut Config),
        }
        let cases = [
            Case {
                description: "bad listen address",
                mutate: |c| c.listen_addr = "nowhere".to_string(),
            },
            Case {
                description: "machine without containers",
                mutate: |c| c.machines[0].resources.clear(),
            },
            Case {
                description: "zero per_iter",
                mutate: |c| c.exec.per_iter = 0,
            },
            Case {
                description: "empty ffmpeg path",
                mutate: |c| c.ffmpeg.ffmpeg_path.clear(),
            },
        ];
        assert!(Config::default().validate().is_ok());
        for case in cases {
            let mut config = Config::default();
            (case.mutate)(&mut config);
            assert!(config.validate().is_err(), "{}", case.description);
        }
    }
}
