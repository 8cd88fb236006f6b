//! Field storage identities and thread categories.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Thread category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    /// The privileged mutator role.
    Owner,
    /// Every other thread.
    Other,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Owner => "OWNER",
            Category::Other => "OTHER",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque per-instance identity token.
///
/// Two receivers are the same storage owner iff their tokens are equal; no
/// deep equality is involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReceiverId(pub u64);

impl fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies one field storage slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldKey {
    Instance {
        owner: Arc<str>,
        field: Arc<str>,
        receiver: ReceiverId,
    },
    Static {
        owner: Arc<str>,
        field: Arc<str>,
    },
}

impl FieldKey {
    pub fn instance(owner: &str, field: &str, receiver: ReceiverId) -> Self {
        FieldKey::Instance {
            owner: Arc::from(owner),
            field: Arc::from(field),
            receiver,
        }
    }

    pub fn of_static(owner: &str, field: &str) -> Self {
        FieldKey::Static {
            owner: Arc::from(owner),
            field: Arc::from(field),
        }
    }

    pub fn owner(&self) -> &str {
        match self {
            FieldKey::Instance { owner, .. } | FieldKey::Static { owner, .. } => owner,
        }
    }

    pub fn field(&self) -> &str {
        match self {
            FieldKey::Instance { field, .. } | FieldKey::Static { field, .. } => field,
        }
    }

    pub fn receiver(&self) -> Option<ReceiverId> {
        match self {
            FieldKey::Instance { receiver, .. } => Some(*receiver),
            FieldKey::Static { .. } => None,
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self, FieldKey::Static { .. })
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKey::Instance {
                owner,
                field,
                receiver,
            } => write!(f, "{}.{}.{}", receiver.0, owner, field),
            FieldKey::Static { owner, field } => write!(f, "static.{}.{}", owner, field),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_instance_keys_distinguish_receivers() {
        let a = FieldKey::instance("com/model/Model", "value", ReceiverId(1));
        let b = FieldKey::instance("com/model/Model", "value", ReceiverId(2));
        let a2 = FieldKey::instance("com/model/Model", "value", ReceiverId(1));
        assert_ne!(a, b);
        assert_eq!(a, a2);

        let set: HashSet<_> = [a, b, a2].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_static_key_has_no_receiver() {
        let key = FieldKey::of_static("com/model/Model", "name");
        assert!(key.is_static());
        assert_eq!(key.receiver(), None);
        assert_eq!(key.to_string(), "static.com/model/Model.name");
    }

    #[test]
    fn test_instance_key_display() {
        let key = FieldKey::instance("com/model/Model", "v", ReceiverId(42));
        assert_eq!(key.to_string(), "42.com/model/Model.v");
        assert_eq!(key.owner(), "com/model/Model");
        assert_eq!(key.field(), "v");
    }
}
