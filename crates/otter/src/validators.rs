//! Result checks shared by task `validate` phases.
//!
//! Validators return booleans; `check` adapts a false result into a task
//! validation failure so bodies can chain them with `?`.

use crate::storage::StorageHandle;
use otter_core::{Config, TaskError};
use tracing::{debug, warn};

/// Turn a validator verdict into a task validation failure.
pub fn check(name: &str, passed: bool) -> Result<(), TaskError> {
    if passed {
        debug!(validator = name, "validator passed");
        Ok(())
    } else {
        Err(TaskError::Validation(format!("validator {name} failed")))
    }
}

/// Whether a resource exists.
pub async fn exists(location: &str, config: &Config, force_local: bool) -> bool {
    match resolve(location, config, force_local) {
        Some(handle) => {
            let found = handle.exists().await;
            if !found {
                warn!(location, "resource does not exist");
            }
            found
        }
        None => false,
    }
}

/// Whether two resources have the same size. A side whose size cannot be
/// determined skips the comparison rather than failing it.
pub async fn same_size(one: &str, two: &str, config: &Config, force_local_two: bool) -> bool {
    let first = match resolve(one, config, false) {
        Some(h) => h,
        None => return false,
    };
    let second = match resolve(two, config, force_local_two) {
        Some(h) => h,
        None => return false,
    };

    let first_stat = match first.stat().await {
        Ok(s) => s,
        Err(e) => {
            warn!(location = one, error = %e, "error getting metadata");
            return false;
        }
    };
    let second_stat = match second.stat().await {
        Ok(s) => s,
        Err(e) => {
            warn!(location = two, error = %e, "error getting metadata");
            return false;
        }
    };

    match (first_stat.size, second_stat.size) {
        (Some(a), Some(b)) => {
            debug!(one, two, size_one = a, size_two = b, "comparing sizes");
            a == b
        }
        _ => {
            warn!(one, two, "size unavailable, skipping comparison");
            true
        }
    }
}

fn resolve(location: &str, config: &Config, force_local: bool) -> Option<StorageHandle> {
    let handle = if location.contains("://") || location.starts_with('/') {
        StorageHandle::external(location)
    } else if force_local {
        StorageHandle::local(location, config)
    } else {
        StorageHandle::new(location, config)
    };
    match handle {
        Ok(h) => Some(h),
        Err(e) => {
            warn!(location, error = %e, "error resolving location");
            None
        }
    }
}
