use std::collections::HashSet;

use tracing::debug;

/// Decides whether a tool may run given the capabilities granted to the runtime.
///
/// With enforcement off every tool is allowed, matching the default desktop setup.
#[derive(Debug, Clone, Default)]
pub struct CapabilityGate {
    enforce: bool,
    granted: HashSet<String>,
}

impl CapabilityGate {
    pub fn permissive() -> Self {
        Self::default()
    }

    pub fn enforcing<I, S>(granted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enforce: true,
            granted: granted
                .into_iter()
                .map(|s| s.into().trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn is_enforcing(&self) -> bool {
        self.enforce
    }

    pub fn grant(&mut self, capability: &str) {
        self.granted.insert(capability.trim().to_ascii_lowercase());
    }

    /// `true` when every required capability has been granted.
    pub fn allowed(&self, tool_name: &str, required: &[&str]) -> bool {
        if !self.enforce {
            return true;
        }
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|cap| !self.granted.contains(&cap.to_ascii_lowercase()))
            .collect();
        if missing.is_empty() {
            true
        } else {
            debug!(tool = tool_name, ?missing, "tool blocked by capability gate");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissive_allows_everything() {
        let gate = CapabilityGate::permissive();
        assert!(gate.allowed("file_write", &["fs.write"]));
    }

    #[test]
    fn enforcing_requires_all_capabilities() {
        let gate = CapabilityGate::enforcing(["net.fetch", " Weather.Read "]);
        assert!(gate.allowed("weather_lookup", &["weather.read"]));
        assert!(gate.allowed("web_search", &["net.fetch"]));
        assert!(!gate.allowed("crypto_portfolio", &["net.fetch", "finance.read"]));
        assert!(gate.allowed("noop", &[]));
    }

    #[test]
    fn grant_extends_enforcing_gate() {
        let mut gate = CapabilityGate::enforcing(Vec::<String>::new());
        assert!(!gate.allowed("deliver_report", &["conversation.write"]));
        gate.grant("conversation.write");
        assert!(gate.allowed("deliver_report", &["conversation.write"]));
    }
}
