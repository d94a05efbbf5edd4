//! Runtime configuration
//!
//! Every [`ThreadContext`](crate::context::ThreadContext) snapshots the
//! process-wide default when it is created. The default is read once from the
//! environment:
//!
//! - `TANDEM_MAX_FORWARD_DEPTH`: maximum scheduler layering depth
//! - `TANDEM_FIBER_STACK_SIZE`: carrier stack size in bytes for new fibers

use once_cell::sync::Lazy;
use std::env;

/// Default bound on nested scheduler forwarding
pub const DEFAULT_MAX_FORWARD_DEPTH: usize = 64;

/// Environment variable overriding [`Config::max_forward_depth`]
pub const ENV_MAX_FORWARD_DEPTH: &str = "TANDEM_MAX_FORWARD_DEPTH";

/// Environment variable overriding [`Config::fiber_stack_size`]
pub const ENV_FIBER_STACK_SIZE: &str = "TANDEM_FIBER_STACK_SIZE";

static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(Config::from_env);

/// Per-thread runtime settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of wrapped schedulers a single hook call may pass
    /// through before failing with `Error::ForwardingTooDeep`
    ///
    /// This caps every stack, not only cyclic ones: a chain of more than this
    /// many `Layered` schedulers fails even when it terminates. Raise it for
    /// deeper acyclic stacks.
    pub max_forward_depth: usize,

    /// Stack size for fiber carrier threads (None = platform default)
    pub fiber_stack_size: Option<usize>,

    /// Prefix for carrier thread names; the fiber id is appended
    pub carrier_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_forward_depth: DEFAULT_MAX_FORWARD_DEPTH,
            fiber_stack_size: None,
            carrier_name_prefix: "tandem-fiber".to_string(),
        }
    }
}

impl Config {
    /// Defaults overridden by any valid `TANDEM_*` environment variables
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(depth) = parse_env(ENV_MAX_FORWARD_DEPTH) {
            config.max_forward_depth = depth;
        }
        if let Some(size) = parse_env(ENV_FIBER_STACK_SIZE) {
            config.fiber_stack_size = Some(size);
        }
        config
    }

    /// Set the maximum forwarding depth
    ///
    /// Must be at least the number of layers in the deepest scheduler stack.
    pub fn with_max_forward_depth(mut self, depth: usize) -> Self {
        self.max_forward_depth = depth;
        self
    }

    /// Set the carrier stack size
    pub fn with_fiber_stack_size(mut self, size: usize) -> Self {
        self.fiber_stack_size = Some(size);
        self
    }
}

/// The process-wide default configuration
pub fn default_config() -> &'static Config {
    &DEFAULT_CONFIG
}

fn parse_env(name: &str) -> Option<usize> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            log::warn!("ignoring invalid {}={:?}", name, raw);
            None
        }
    }
}
