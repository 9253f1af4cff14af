use std::path::PathBuf;

use argh::FromArgs;

#[derive(Debug, Clone, FromArgs)]
/// Mirach sidechain node.
pub struct Args {
    /// path to the TOML config file
    #[argh(option, short = 'c')]
    pub config: PathBuf,

    /// override the data directory from the config
    #[argh(option)]
    pub datadir: Option<PathBuf>,
}

/// One-shot actions driven purely by env vars.
#[derive(Debug, Clone, Copy, Default)]
pub struct RebuildOptions {
    pub rebuild_state: bool,
    pub no_verify: bool,
    pub no_validate: bool,
    pub terminate_after: bool,
}

impl RebuildOptions {
    pub fn from_env() -> Self {
        let flag = |name: &str| std::env::var(name).map(|v| v == "1").unwrap_or(false);
        Self {
            rebuild_state: flag("REBUILD_STATE"),
            no_verify: flag("REBUILD_NO_VERIFY"),
            no_validate: flag("REBUILD_NO_VALIDATE"),
            terminate_after: flag("TERMINATE_AFTER_REBUILD"),
        }
    }
}
