use std::fmt;

/// Namespace a native object lives in. Both kinds share cache semantics but never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// Base records and placed references.
    Object,
    /// Mobile simulation objects (actors, projectiles).
    Mobile,
}

impl ObjectKind {
    pub fn label(self) -> &'static str {
        match self {
            ObjectKind::Object => "object",
            ObjectKind::Mobile => "mobile",
        }
    }
}

/// Opaque key for a native object: its address plus kind tag.
///
/// Only compared and hashed, never turned back into a pointer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    kind: ObjectKind,
    address: u64,
}

impl Identity {
    pub const fn new(kind: ObjectKind, address: u64) -> Self {
        Self { kind, address }
    }

    pub const fn object(address: u64) -> Self {
        Self::new(ObjectKind::Object, address)
    }

    pub const fn mobile(address: u64) -> Self {
        Self::new(ObjectKind::Mobile, address)
    }

    /// Derives an identity from a live native reference. The pointer is read for its value only.
    pub fn of<T>(kind: ObjectKind, native: &T) -> Self {
        Self::new(kind, native as *const T as usize as u64)
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn address(&self) -> u64 {
        self.address
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x}", self.kind.label(), self.address)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Key that scopes an event (and listeners) to a single target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKey {
    Object(Identity),
    Value(i64),
}

impl From<Identity> for FilterKey {
    fn from(identity: Identity) -> Self {
        FilterKey::Object(identity)
    }
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterKey::Object(identity) => write!(f, "{identity}"),
            FilterKey::Value(value) => write!(f, "{value}"),
        }
    }
}
