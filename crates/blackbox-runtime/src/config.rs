#![forbid(unsafe_code)]

//! Configuration for providers, consumers and boundaries.
//!
//! All knobs are plain structs with sensible defaults. [`ProviderConfig`] is
//! sanitized when a provider is built, so out-of-range values degrade to
//! defaults instead of failing.

use std::env;

/// Key under which secondary derivation values are folded into a merged
/// result, unless overridden.
pub const DEFAULT_APPENDED_KEY: &str = "appended";

/// Default number of diagnostics retained by the provider's log.
pub const DEFAULT_DIAGNOSTIC_CAPACITY: usize = 256;

/// Tree-root configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Skip a pass when the state source returns a reference-identical
    /// state to the one last pulled.
    /// Default: true
    pub pure: bool,

    /// Check that state, dispatch and merge derivations produce mappings.
    /// Default: true
    pub check_shapes: bool,

    /// Warn when a props-dependent derivation has no props selector.
    /// Default: true
    pub warn_missing_props_selector: bool,

    /// Key for folded secondary values inside a merged result.
    /// Default: `"appended"`
    pub appended_key: String,

    /// Maximum number of retained diagnostics.
    /// Default: 256
    pub diagnostic_capacity: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            pure: true,
            check_shapes: true,
            warn_missing_props_selector: true,
            appended_key: DEFAULT_APPENDED_KEY.to_owned(),
            diagnostic_capacity: DEFAULT_DIAGNOSTIC_CAPACITY,
        }
    }
}

impl ProviderConfig {
    /// Defaults overridden by `BLACKBOX_CHECK_SHAPES` and
    /// `BLACKBOX_DIAGNOSTIC_CAPACITY`.
    #[must_use]
    pub fn from_env() -> Self {
        let check_shapes = env::var("BLACKBOX_CHECK_SHAPES").ok();
        let capacity = env::var("BLACKBOX_DIAGNOSTIC_CAPACITY").ok();
        Self::from_vars(check_shapes.as_deref(), capacity.as_deref())
    }

    fn from_vars(check_shapes: Option<&str>, capacity: Option<&str>) -> Self {
        let mut config = Self::default();
        if let Some(flag) = check_shapes.and_then(parse_flag) {
            config.check_shapes = flag;
            config.warn_missing_props_selector = flag;
        }
        if let Some(capacity) = capacity.and_then(|raw| raw.trim().parse::<usize>().ok()) {
            config.diagnostic_capacity = capacity;
        }
        config.sanitized()
    }

    pub(crate) fn sanitized(&self) -> Self {
        let mut config = self.clone();
        if config.appended_key.is_empty() {
            config.appended_key = DEFAULT_APPENDED_KEY.to_owned();
        }
        config.diagnostic_capacity = config.diagnostic_capacity.max(1);
        config
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Per-consumer options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Skip re-rendering when nothing relevant changed. Impure consumers
    /// re-merge and re-render on every update.
    /// Default: true
    pub pure: bool,

    /// Allow the host to attach, and callers to read, the wrapped instance.
    /// Default: false
    pub with_ref: bool,

    /// Name of the wrapped component; the display name is `Connect(name)`.
    /// Default: `"Component"`
    pub name: String,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            pure: true,
            with_ref: false,
            name: "Component".to_owned(),
        }
    }
}

impl ConnectOptions {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn pure(mut self, pure: bool) -> Self {
        self.pure = pure;
        self
    }

    #[must_use]
    pub fn with_ref(mut self, with_ref: bool) -> Self {
        self.with_ref = with_ref;
        self
    }

    /// `Connect(<name>)`.
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("Connect({})", self.name)
    }
}

/// Per-boundary options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryOptions {
    /// When false the boundary propagates every snapshot.
    /// Default: true
    pub pure: bool,
}

impl Default for BoundaryOptions {
    fn default() -> Self {
        Self { pure: true }
    }
}
