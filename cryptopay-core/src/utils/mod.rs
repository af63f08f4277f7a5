pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock, to_primitive, unix_seconds};
