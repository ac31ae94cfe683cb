//! Shared utilities: injectable clocks and opaque pagination cursors.

pub mod clock;
pub mod cursor;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cursor::{create_cursor, parse_cursor, Cursor};
