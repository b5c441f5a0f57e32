use kestrel_script_bridge::cli::CliOverrides;
use kestrel_script_bridge::config::BridgeConfig;
use kestrel_script_bridge::host::{self, HostOptions};
use kestrel_script_bridge::logging;

fn main() {
    let overrides = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed.into_config_overrides(),
        Err(err) => {
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    let mut config = overrides.config_path.as_ref().map(BridgeConfig::load_or_default).unwrap_or_default();
    config.apply_overrides(&overrides);
    logging::init(&config.logging);
    if !overrides.is_empty() {
        tracing::info!(fields = ?overrides.applied_fields(), "applied command-line overrides");
    }

    let defaults = HostOptions::default();
    let options = HostOptions { frames: overrides.frames.unwrap_or(defaults.frames), ..defaults };
    if let Err(err) = host::run(&config, options) {
        eprintln!("Application error: {err:?}");
        std::process::exit(1);
    }
}
