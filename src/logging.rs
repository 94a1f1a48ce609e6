use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::Local;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, TermLogger, TerminalMode, WriteLogger,
};
use time::macros::format_description;

use crate::error::{PipelineError, Result};

/// File logger at info level under `log_dir`, plus warnings on the terminal.
///
/// The log file is named `<timestamp>+<run_name>.log` so consecutive runs of the
/// same stage never overwrite each other. Returns the log path.
pub fn init(log_dir: &Path, run_name: &str) -> Result<PathBuf> {
    fs::create_dir_all(log_dir).map_err(|e| PipelineError::io(log_dir, e))?;

    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let log_path = log_dir.join(format!("{timestamp}+{run_name}.log"));
    let log_file = fs::File::create(&log_path).map_err(|e| PipelineError::io(&log_path, e))?;

    let config = ConfigBuilder::new()
        .set_time_format_custom(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))
        .build();

    CombinedLogger::init(vec![
        WriteLogger::new(LevelFilter::Info, config.clone(), log_file),
        TermLogger::new(
            LevelFilter::Warn,
            config,
            TerminalMode::Stderr,
            ColorChoice::Auto,
        ),
    ])
    .map_err(|e| PipelineError::Config(format!("failed to initialise logger: {e}")))?;

    log::info!("Program started ({run_name})");
    Ok(log_path)
}
