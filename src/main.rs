mod config;
mod dimse;
mod proxy;
mod rules;
mod spool;
mod transform;
mod types;

use crate::config::AppConfig;
use crate::proxy::ProxyServiceClassProvider;
use crate::transform::TemplateCache;
use std::sync::Arc;
use tracing::{debug, error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_AET: &str = "DCMPRX";

fn init_logger(level: tracing::Level) -> Result<(), anyhow::Error> {
	let subscriber = tracing_subscriber::fmt()
		.compact()
		.with_file(true)
		.with_line_number(true)
		.with_target(false)
		.with_env_filter(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)?;
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
	let config = AppConfig::new()?;
	init_logger(config.telemetry.level)?;

	debug!("Config: {config:?}");

	spool::recovery::reset_spool_files(&config.aets, "start-up");

	let templates = Arc::new(TemplateCache::new());

	for listener in &config.server.dimse {
		match config.application_entity(&listener.aet) {
			Some(ae) => {
				let provider = ProxyServiceClassProvider::new(
					listener.clone(),
					ae.clone(),
					Arc::clone(&templates),
				);
				tokio::spawn(async move {
					if let Err(err) = provider.spawn().await {
						error!("Proxy Service Class Provider terminated: {err}");
					}
				});
			}
			None => warn!(
				"No application entity configured for listener AET {}",
				listener.aet
			),
		}
	}

	tokio::signal::ctrl_c().await?;
	info!("Shutting down");
	spool::recovery::reset_spool_files(&config.aets, "shut-down");

	Ok(())
}
