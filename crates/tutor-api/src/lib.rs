//! Domain and protocol types for tutord
//!
//! This crate defines the types shared by every layer:
//! - Sessions, pairings, reschedule requests, scheduled jobs
//! - Commands (requests from IPC clients) and responses
//! - Realtime events (service -> subscribed parties)
//! - Versioning

/// Unit-only enum persisted as a fixed text tag.
macro_rules! stored_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $tag:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $tag)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $tag,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::UnknownTag;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($tag => Ok($name::$variant),)+
                    other => Err($crate::UnknownTag {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

mod commands;
mod events;
mod jobs;
mod types;

pub use commands::*;
pub use events::*;
pub use jobs::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;

/// A stored tag that does not name any variant of the expected enum
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} tag: {value:?}")]
pub struct UnknownTag {
    pub kind: &'static str,
    pub value: String,
}
