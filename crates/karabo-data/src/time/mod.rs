//! # Time
//!
//! Wall-clock [`Epochstamp`]s (UTC seconds + attoseconds), facility
//! [`Trainstamp`]s, their pairing as a [`Timestamp`], and the [`TrainClock`]
//! that extrapolates train ids from the last time-server tick.

mod epochstamp;
mod timestamp;
mod train_clock;

pub use epochstamp::{Epochstamp, ATTOSEC_PER_MICROSEC, ATTOSEC_PER_SEC};
pub use timestamp::{Timestamp, Trainstamp};
pub use train_clock::{TimeTick, TrainClock};
