//! Logger setup for the injected runtime.

use std::fs::File;
use std::sync::Mutex;

use tracing::trace;

use crate::config::Config;
use crate::errors::{InjectError, Result};

/// Installs the global [`tracing`] subscriber described by `config`
///
/// Logs go to `config.log_file`, which is truncated, or to stderr if no file is configured.
pub fn setup_logger(config: &Config) -> Result<()> {
    let level = config.level()?;
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .without_time()
        .with_target(false);

    let installed = match &config.log_file {
        Some(path) => {
            let file = File::create(path)?;
            let subscriber = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
        None => {
            let subscriber = builder.with_writer(std::io::stderr).finish();
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    installed.map_err(|e| InjectError::Logger(e.to_string()))?;

    trace!("set up the logger");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bad_level_is_rejected_before_install() {
        let config = Config {
            log_level: "chatty".to_string(),
            ..Default::default()
        };
        assert!(matches!(setup_logger(&config), Err(InjectError::Logger(_))));
    }
}
