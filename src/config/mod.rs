use crate::rules::ForwardRule;
use crate::types::AE;
use crate::DEFAULT_AET;

use serde::de::Error;
use serde::{Deserialize, Deserializer};
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
	#[serde(default)]
	pub telemetry: TelemetryConfig,
	#[serde(default)]
	pub server: ServerConfig,
	#[serde(default)]
	pub aets: Vec<ApplicationEntityConfig>,
}

impl AppConfig {
	/// Loads the application configuration from the following sources:
	/// 1. Defaults (defined in `defaults.yaml`)
	/// 2. `config.yaml` in the same folder as the executable binary
	/// 3. From environment variables, prefixed with `DICOM_PRX`
	/// # Errors
	/// Returns a [`config::ConfigError`] if source collection fails.
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::{Config, Environment, File, FileFormat};
		Config::builder()
			.add_source(File::from_str(
				include_str!("defaults.yaml"),
				FileFormat::Yaml,
			))
			.add_source(File::with_name("config.yaml").required(false))
			.add_source(Environment::with_prefix("DICOM_PRX").separator("_"))
			.build()?
			.try_deserialize()
	}

	/// Looks up the proxy AE configuration serving the given AE title.
	pub fn application_entity(&self, aet: &str) -> Option<&ApplicationEntityConfig> {
		self.aets.iter().find(|ae| ae.aet == aet)
	}
}

/// A proxy Application Entity: the spool roots it owns and the ordered
/// forward rules applied to requests accepted under its AE title.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApplicationEntityConfig {
	pub aet: AE,
	pub spool: SpoolConfig,
	#[serde(default)]
	pub forward_rules: Vec<ForwardRule>,
}

/// Absolute spool roots for the DIMSE services of one proxy AE. Files are
/// spooled as `<root>/<destinationAET>/<file>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SpoolConfig {
	pub cstore_dir: PathBuf,
	pub ncreate_dir: PathBuf,
	pub nset_dir: PathBuf,
	pub naction_dir: PathBuf,
	pub nevent_dir: PathBuf,
	pub dose_sr_dir: PathBuf,
}

impl SpoolConfig {
	/// The roots swept by the recovery sweeper, in sweep order.
	pub fn sweep_roots(&self) -> [&PathBuf; 5] {
		[
			&self.cstore_dir,
			&self.naction_dir,
			&self.nevent_dir,
			&self.ncreate_dir,
			&self.nset_dir,
		]
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
	pub aet: AE,
	pub dimse: Vec<DimseServerConfig>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			aet: AE::from(DEFAULT_AET),
			dimse: vec![DimseServerConfig::default()],
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DimseServerConfig {
	pub interface: IpAddr,
	#[serde(default = "DimseServerConfig::default_aet")]
	pub aet: AE,
	#[serde(default = "DimseServerConfig::default_port")]
	pub port: u16,
	#[serde(default = "DimseServerConfig::default_uncompressed")]
	pub uncompressed: bool,
}

impl DimseServerConfig {
	pub const fn default_port() -> u16 {
		11112
	}
	pub const fn default_uncompressed() -> bool {
		true
	}

	pub fn default_aet() -> AE {
		AE::from(DEFAULT_AET)
	}
}

impl Default for DimseServerConfig {
	fn default() -> Self {
		Self {
			interface: IpAddr::from([0, 0, 0, 0]),
			port: Self::default_port(),
			aet: Self::default_aet(),
			uncompressed: true,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryConfig {
	#[serde(deserialize_with = "deserialize_log_level")]
	pub level: tracing::Level,
}

impl Default for TelemetryConfig {
	fn default() -> Self {
		Self {
			level: tracing::Level::INFO,
		}
	}
}

/// Deserializer for [`tracing::Level`] as it does not implement [Deserialize]
fn deserialize_log_level<'de, D>(deserializer: D) -> Result<tracing::Level, D::Error>
where
	D: Deserializer<'de>,
{
	let value = String::deserialize(deserializer)?;

	tracing::Level::from_str(&value)
		.map_err(|_| Error::unknown_variant(&value, &["TRACE", "DEBUG", "INFO", "WARN", "ERROR"]))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_deserialize() {
		let config = AppConfig::new().expect("defaults.yaml should deserialize");
		assert_eq!(config.server.aet, DEFAULT_AET);
		assert!(!config.server.dimse.is_empty());
	}

	#[test]
	fn ae_config_from_yaml() {
		use config::{Config, File, FileFormat};

		let yaml = r"
aets:
  - aet: PROXY
    spool:
      cstore-dir: /var/spool/prx/cstore
      ncreate-dir: /var/spool/prx/ncreate
      nset-dir: /var/spool/prx/nset
      naction-dir: /var/spool/prx/naction
      nevent-dir: /var/spool/prx/nevent
      dose-sr-dir: /var/spool/prx/dosesr
    forward-rules:
      - destinations: [ARCHIVE]
        use-calling-aet: PROXY
";
		let config: AppConfig = Config::builder()
			.add_source(File::from_str(yaml, FileFormat::Yaml))
			.build()
			.unwrap()
			.try_deserialize()
			.unwrap();

		let ae = config.application_entity("PROXY").unwrap();
		assert_eq!(ae.forward_rules.len(), 1);
		assert_eq!(ae.forward_rules[0].destinations, vec![AE::from("ARCHIVE")]);
		assert_eq!(ae.forward_rules[0].use_calling_aet.as_deref(), Some("PROXY"));
		assert_eq!(ae.spool.sweep_roots().len(), 5);
	}
}
