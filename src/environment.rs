//! Environment capability detection.
//!
//! Capabilities are resolved by querying an ordered list of providers; the first provider with
//! an answer wins, and a terminal default provider guarantees every query resolves.

/// A single source of environment capabilities. Return `None` from a query to defer to the next
/// provider in the chain.
pub trait CapabilityProvider: Send + Sync {
    /// Whether repeated online transitions should be throttled.
    fn throttling_enabled(&self) -> Option<bool> {
        None
    }

    /// Whether this is a debug/integration-harness build.
    fn debug_build(&self) -> Option<bool> {
        None
    }
}

struct DefaultProvider;

impl CapabilityProvider for DefaultProvider {
    fn throttling_enabled(&self) -> Option<bool> {
        Some(true)
    }

    fn debug_build(&self) -> Option<bool> {
        Some(false)
    }
}

/// Resolves environment capabilities through a provider chain.
pub struct EnvironmentReporter {
    providers: Vec<Box<dyn CapabilityProvider>>,
}

impl EnvironmentReporter {
    /// Build a reporter that queries `providers` in order, falling through to built-in defaults.
    pub fn new(mut providers: Vec<Box<dyn CapabilityProvider>>) -> EnvironmentReporter {
        providers.push(Box::new(DefaultProvider));
        EnvironmentReporter { providers }
    }

    /// Whether this is a debug/integration-harness build.
    pub fn debug_build(&self) -> bool {
        self.providers
            .iter()
            .find_map(|provider| provider.debug_build())
            .unwrap_or(false)
    }

    /// Whether online transitions should be throttled. Debug builds are never throttled, so
    /// integration harnesses can cycle the online state freely.
    pub fn throttling_enabled(&self) -> bool {
        let enabled = self
            .providers
            .iter()
            .find_map(|provider| provider.throttling_enabled())
            .unwrap_or(true);
        enabled && !self.debug_build()
    }
}

impl Default for EnvironmentReporter {
    fn default() -> EnvironmentReporter {
        EnvironmentReporter::new(Vec::new())
    }
}
