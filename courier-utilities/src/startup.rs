use std::{env, path::Path};

use log::{LevelFilter, info};

use crate::{errors::SendableError, logger};

pub fn startup(name: &str, level: LevelFilter, log_file: Option<&Path>) -> Result<(), SendableError> {
    logger::setup_logger(level, log_file)?;
    log_panics::init();

    info!("--- {} ---", name);
    info!("The current directory is {}", env::current_dir()?.display());
    Ok(())
}
