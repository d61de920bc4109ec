//! Origin tags attached to every applied delta.
//!
//! Each synchronization channel applies inbound deltas under its own
//! origin so that change observers can tell which channel produced a
//! change and never send it back out on the same channel.
//!
//! Origins travel through `yrs` transactions as a compact byte tag:
//! ```text
//! ┌─────┬──────────────────────┐
//! │ tag │ instance (Tab only)  │
//! │ 1 B │ 16 bytes             │
//! └─────┴──────────────────────┘
//! ```

use uuid::Uuid;

const TAG_LOCAL: u8 = 0;
const TAG_STORAGE: u8 = 1;
const TAG_TAB: u8 = 2;
const TAG_NETWORK: u8 = 3;

/// Which channel produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A consumer write on this replica.
    Local,
    /// State loaded from the storage adapter.
    Storage,
    /// A delta received by the tab broadcast instance with this id.
    Tab(Uuid),
    /// A delta received from the network peer.
    Network,
}

impl Origin {
    /// Encode into the byte tag carried by a transaction.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Origin::Local => vec![TAG_LOCAL],
            Origin::Storage => vec![TAG_STORAGE],
            Origin::Tab(instance) => {
                let mut bytes = Vec::with_capacity(17);
                bytes.push(TAG_TAB);
                bytes.extend_from_slice(instance.as_bytes());
                bytes
            }
            Origin::Network => vec![TAG_NETWORK],
        }
    }

    /// Decode a byte tag. Unknown or missing tags are treated as local writes.
    pub fn from_bytes(bytes: &[u8]) -> Origin {
        match bytes {
            [TAG_STORAGE] => Origin::Storage,
            [TAG_NETWORK] => Origin::Network,
            [TAG_TAB, rest @ ..] => match Uuid::from_slice(rest) {
                Ok(instance) => Origin::Tab(instance),
                Err(_) => Origin::Local,
            },
            _ => Origin::Local,
        }
    }

    /// Recover the origin of a `yrs` transaction.
    pub fn from_yrs(origin: Option<&yrs::Origin>) -> Origin {
        match origin {
            Some(origin) => Origin::from_bytes(origin.as_ref()),
            None => Origin::Local,
        }
    }

    /// Whether this origin is a remote channel (tab or network).
    pub fn is_remote(&self) -> bool {
        matches!(self, Origin::Tab(_) | Origin::Network)
    }
}

impl From<Origin> for yrs::Origin {
    fn from(origin: Origin) -> Self {
        yrs::Origin::from(origin.to_bytes().as_slice())
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Local => write!(f, "local"),
            Origin::Storage => write!(f, "storage"),
            Origin::Tab(instance) => write!(f, "tab:{instance}"),
            Origin::Network => write!(f, "network"),
        }
    }
}
