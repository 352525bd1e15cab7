//! Concurrent ordered collections whose unlinked nodes wait in a purgatory
//! until no cursor can reach them anymore.

mod list;
mod lock;
mod logger;
mod map;
mod node;
mod purgatory;
mod unsafe_box;

pub use self::list::{Cursor as ListCursor, List};
pub use self::logger::{Log, NoopLogger, TrackingLogger};
pub use self::map::{AvlMap, Cursor as MapCursor};
