//! Host platform (linux for example) utility functions

use std::{env, path::PathBuf};

/// Environment variable pointing at the root of the car software tree, the directory holding
/// `params/` and `sessions/`.
pub const SW_ROOT_ENV_VAR: &str = "CAR_SW_ROOT";

/// Get the root directory of the car software.
pub fn get_sw_root() -> Result<PathBuf, env::VarError> {
    env::var(SW_ROOT_ENV_VAR).map(PathBuf::from)
}
