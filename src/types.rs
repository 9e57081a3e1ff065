//! NewType wrappers for the names passed between the runner and its actors.
//!
//! These keep an application name from being passed where a module path or
//! an actor address is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Address of an actor reachable through the mailbox, e.g. `"arbiter"`
    /// or the name of a worker.
    ActorName
);

newtype_string!(
    /// Name of an application hosted by the arbiter.
    ///
    /// For discovered suites this is the sub-directory name under a test
    /// directory, e.g. `"chat"`.
    AppName
);

newtype_string!(
    /// Dotted path of a test module, e.g. `"tests.chat.regression"`. This is
    /// the key classes are registered under.
    ModuleName
);

newtype_string!(
    /// Correlation identifier stamped into every application configuration.
    ExecutionId
);

impl ActorName {
    /// The supervising actor.
    pub fn arbiter() -> Self {
        Self::new(crate::actor::ARBITER)
    }
}

impl ExecutionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_name_creation() {
        let name = ModuleName::new("tests.chat.regression");
        assert_eq!(name.as_str(), "tests.chat.regression");
        assert_eq!(name.to_string(), "tests.chat.regression");
    }

    #[test]
    fn test_app_name_from_string() {
        let app: AppName = "chat".into();
        assert_eq!(app.as_str(), "chat");

        let app: AppName = String::from("calculator").into();
        assert_eq!(app.into_inner(), "calculator");
    }

    #[test]
    fn test_serde_transparent() {
        let name = ActorName::new("worker-1");
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"worker-1\"");

        let parsed: ActorName = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn test_arbiter_address() {
        assert_eq!(ActorName::arbiter().as_str(), "arbiter");
    }

    #[test]
    fn test_execution_ids_are_unique() {
        let a = ExecutionId::generate();
        let b = ExecutionId::generate();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_borrow_in_sets() {
        use std::collections::BTreeSet;

        let mut set = BTreeSet::new();
        set.insert(AppName::new("chat"));
        assert!(set.contains("chat"));
        assert!(!set.contains("taskqueue"));
    }
}
