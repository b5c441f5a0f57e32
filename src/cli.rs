use crate::config::BridgeConfigOverrides;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    config: Option<PathBuf>,
    script: Option<PathBuf>,
    frames: Option<u32>,
    log: Option<String>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            let Some(key) = flag.strip_prefix("--") else {
                bail!("Unexpected argument '{flag}'. Use --config/--script/--frames/--log with values.");
            };
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "config" => overrides.config = Some(PathBuf::from(value)),
                "script" => overrides.script = Some(PathBuf::from(value)),
                "frames" => {
                    let frames = value.parse::<u32>().with_context(|| format!("Invalid frame count '{value}'"))?;
                    if frames == 0 {
                        bail!("--frames must be at least 1");
                    }
                    overrides.frames = Some(frames);
                }
                "log" => overrides.log = Some(value),
                _ => bail!("Unknown flag '{flag}'. Supported flags: --config, --script, --frames, --log."),
            }
        }
        Ok(overrides)
    }

    pub fn into_config_overrides(self) -> BridgeConfigOverrides {
        BridgeConfigOverrides {
            config_path: self.config,
            main_script: self.script,
            frames: self.frames,
            log_filter: self.log,
        }
    }
}
