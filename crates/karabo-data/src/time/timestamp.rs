//! Train ids and the (epoch, train) pair attached to property values.

use serde::{Deserialize, Serialize};

use crate::errors::{KaraboError, Result};
use crate::hash::Attributes;

use super::Epochstamp;

/// Attribute names carrying a timestamp on a Hash entry.
const SEC: &str = "sec";
const FRAC: &str = "frac";
const TID: &str = "tid";

/// Facility train counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Trainstamp(pub u64);

impl Trainstamp {
    #[must_use]
    pub fn train_id(&self) -> u64 {
        self.0
    }
}

/// Wall-clock time plus train id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub epoch: Epochstamp,
    pub train: Trainstamp,
}

impl Timestamp {
    #[must_use]
    pub fn new(epoch: Epochstamp, train: Trainstamp) -> Self {
        Self { epoch, train }
    }

    /// Now, with the train id of the process-wide [`TrainClock`](super::TrainClock).
    #[must_use]
    pub fn now() -> Self {
        super::TrainClock::global().timestamp(Epochstamp::now())
    }

    #[must_use]
    pub fn train_id(&self) -> u64 {
        self.train.0
    }

    /// Whether `attributes` carry a complete timestamp.
    #[must_use]
    pub fn is_in(attributes: &Attributes) -> bool {
        attributes.has(SEC) && attributes.has(FRAC) && attributes.has(TID)
    }

    /// Write as `sec`/`frac`/`tid` attributes.
    pub fn to_attributes(&self, attributes: &mut Attributes) {
        attributes
            .set(SEC, self.epoch.seconds())
            .set(FRAC, self.epoch.fractional_seconds())
            .set(TID, self.train.0);
    }

    /// Read from `sec`/`frac`/`tid` attributes.
    pub fn from_attributes(attributes: &Attributes) -> Result<Timestamp> {
        if !Self::is_in(attributes) {
            return Err(KaraboError::NotFound("timestamp attributes".into()));
        }
        Ok(Timestamp::new(
            Epochstamp::new(attributes.get_as(SEC)?, attributes.get_as(FRAC)?),
            Trainstamp(attributes.get_as(TID)?),
        ))
    }

    /// Remove timestamp attributes, if any.
    pub fn strip(attributes: &mut Attributes) {
        attributes.erase(SEC);
        attributes.erase(FRAC);
        attributes.erase(TID);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_encoding() {
        let ts = Timestamp::new(Epochstamp::new(100, 7), Trainstamp(42));
        let mut attrs = Attributes::new();
        attrs.set("unit", "m");
        ts.to_attributes(&mut attrs);
        assert!(Timestamp::is_in(&attrs));
        assert_eq!(attrs.get::<u64>("tid").unwrap(), 42);
        assert_eq!(Timestamp::from_attributes(&attrs).unwrap(), ts);

        Timestamp::strip(&mut attrs);
        assert!(!Timestamp::is_in(&attrs));
        assert_eq!(attrs.len(), 1);
        assert!(Timestamp::from_attributes(&attrs).is_err());
    }
}
