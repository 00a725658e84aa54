//! Positional slot arguments.
//!
//! Slot calls, replies and signals carry up to four arguments as
//! `a1..a4` entries of the message body.

use karabo_data::cast;
use karabo_data::{FromValue, Hash, KaraboError, Result, Value};

use crate::message::ARG_KEYS;

/// A tuple of zero to four arguments.
pub trait SlotArgs: Sized + Send + 'static {
    fn into_body(self) -> Hash;
    fn from_body(body: &Hash) -> Result<Self>;
}

/// Argument `key` of `body`, converted to `T` when stored as another type.
pub fn arg<T: FromValue>(body: &Hash, key: &str) -> Result<T> {
    let value = body
        .get_value(key)
        .map_err(|_| KaraboError::NotFound(format!("argument {key} missing")))?;
    if let Some(v) = T::from_value(value) {
        return Ok(v);
    }
    let converted = cast::convert(value, T::TYPE)?;
    T::from_value(&converted).ok_or_else(|| {
        KaraboError::TypeMismatch(format!(
            "argument {key} is {}, expected {}",
            value.value_type(),
            T::TYPE
        ))
    })
}

impl SlotArgs for () {
    fn into_body(self) -> Hash {
        Hash::new()
    }

    fn from_body(_: &Hash) -> Result<Self> {
        Ok(())
    }
}

macro_rules! slot_args {
    ($($t:ident => $i:tt),+) => {
        impl<$($t),+> SlotArgs for ($($t,)+)
        where
            $($t: Into<Value> + FromValue + Send + 'static),+
        {
            fn into_body(self) -> Hash {
                let mut body = Hash::new();
                $(body.set_key(ARG_KEYS[$i], self.$i);)+
                body
            }

            fn from_body(body: &Hash) -> Result<Self> {
                Ok(($(arg::<$t>(body, ARG_KEYS[$i])?,)+))
            }
        }
    };
}

slot_args!(A => 0);
slot_args!(A => 0, B => 1);
slot_args!(A => 0, B => 1, C => 2);
slot_args!(A => 0, B => 1, C => 2, D => 3);
