//! Fully-qualified queue, exchange and RPC names.
//!
//! Client and server sides compute these independently and meet on the broker,
//! so every function here is pure: the same inputs always give the same name.

use crate::error::{PatternsError, Result};

/// Separator used between namespace segments unless configured otherwise
pub const DEFAULT_DIVIDER: &str = ".";

/// Segment inserted between the namespace and the short name of RPC endpoints
pub const RPC_SEGMENT: &str = "rpc";

/// `namespace + divider + short`
pub fn queue_name(namespace: &str, divider: &str, short: &str) -> String {
    format!("{namespace}{divider}{short}")
}

/// Exchanges are named exactly like queues
pub fn exchange_name(namespace: &str, divider: &str, short: &str) -> String {
    queue_name(namespace, divider, short)
}

/// `namespace + divider + "rpc" + divider + short`
pub fn rpc_name(namespace: &str, divider: &str, short: &str) -> String {
    format!("{namespace}{divider}{RPC_SEGMENT}{divider}{short}")
}

/// Namespace and divider of one service, fixed at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    namespace: String,
    divider: String,
}

impl Naming {
    /// Build a naming scheme; both parts must be non-empty
    pub fn new(namespace: impl Into<String>, divider: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let divider = divider.into();

        if namespace.is_empty() {
            return Err(PatternsError::config_error("namespace must not be empty"));
        }
        if divider.is_empty() {
            return Err(PatternsError::config_error("namespace divider must not be empty"));
        }

        Ok(Self { namespace, divider })
    }

    /// Naming scheme using the default `.` divider
    pub fn with_default_divider(namespace: impl Into<String>) -> Result<Self> {
        Self::new(namespace, DEFAULT_DIVIDER)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn divider(&self) -> &str {
        &self.divider
    }

    pub fn queue_name(&self, short: &str) -> String {
        queue_name(&self.namespace, &self.divider, short)
    }

    pub fn exchange_name(&self, short: &str) -> String {
        exchange_name(&self.namespace, &self.divider, short)
    }

    pub fn rpc_name(&self, short: &str) -> String {
        rpc_name(&self.namespace, &self.divider, short)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_and_exchange_names() {
        let naming = Naming::with_default_divider("model.user").unwrap();
        assert_eq!(naming.queue_name("email"), "model.user.email");
        assert_eq!(naming.exchange_name("crud"), "model.user.crud");
        assert_eq!(naming.queue_name("email"), naming.exchange_name("email"));
    }

    #[test]
    fn test_rpc_name() {
        let naming = Naming::with_default_divider("model.user").unwrap();
        assert_eq!(naming.rpc_name("getPassword"), "model.user.rpc.getPassword");
    }

    #[test]
    fn test_custom_divider_is_concatenated_verbatim() {
        let naming = Naming::new("billing", "::").unwrap();
        assert_eq!(naming.queue_name("invoice"), "billing::invoice");
        assert_eq!(naming.rpc_name("total"), "billing::rpc::total");

        // no escaping of dividers that already appear in the parts
        assert_eq!(queue_name("a.b", ".", "c.d"), "a.b.c.d");
    }

    #[test]
    fn test_names_are_deterministic() {
        for (namespace, short) in [("svc", "x"), ("a.b.c", "job"), ("ns", "")] {
            assert_eq!(queue_name(namespace, ".", short), queue_name(namespace, ".", short));
            assert_eq!(queue_name(namespace, ".", short), format!("{namespace}.{short}"));
            assert_eq!(rpc_name(namespace, ".", short), format!("{namespace}.rpc.{short}"));
        }
    }

    #[test]
    fn test_empty_parts_rejected() {
        assert!(matches!(Naming::new("", "."), Err(PatternsError::Config(_))));
        assert!(matches!(Naming::new("svc", ""), Err(PatternsError::Config(_))));
    }
}
