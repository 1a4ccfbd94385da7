//! Built-in task catalog.

pub mod copy;
pub mod copy_many;
pub mod download;
pub mod explode_glob;
pub mod find_latest;
pub mod hello_world;

use crate::registry::TaskRegistry;

/// Register every built-in task type.
pub fn register_builtins(registry: &mut TaskRegistry) {
    registry.register("hello_world", hello_world::build);
    registry.register("copy", copy::build);
    registry.register("copy_many", copy_many::build);
    registry.register("download", download::build);
    registry.register("find_latest", find_latest::build);
    // lenient: its templates carry ${match_*} placeholders that only its
    // own run resolves
    registry.register_lenient("explode_glob", explode_glob::build);
}
