//! Status codes and error handling for hardware calls.

use thiserror::Error;

/// Status codes reported by the bus layer.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HalStatus {
    Success = 0,
    Failure = -1,
    NoMemory = -2,
    InsufficientResources = -3,
    InvalidParameter = -4,
    ItemNotFound = -5,
    ObjectInUse = -6,
    TableFull = -7,
}

impl HalStatus {
    /// Maps a raw status word to a status code. Unknown values collapse
    /// to `Failure`.
    pub fn from_raw(status: i32) -> Self {
        match status {
            0 => HalStatus::Success,
            -2 => HalStatus::NoMemory,
            -3 => HalStatus::InsufficientResources,
            -4 => HalStatus::InvalidParameter,
            -5 => HalStatus::ItemNotFound,
            -6 => HalStatus::ObjectInUse,
            -7 => HalStatus::TableFull,
            _ => HalStatus::Failure,
        }
    }

    /// Returns true if the status indicates success.
    pub fn is_success(&self) -> bool {
        *self == HalStatus::Success
    }

    /// Converts the status into a result.
    pub fn into_result(self) -> HalResult<()> {
        match self {
            HalStatus::Success => Ok(()),
            HalStatus::NoMemory | HalStatus::InsufficientResources | HalStatus::TableFull => {
                Err(HalError::OutOfResources(self))
            }
            HalStatus::InvalidParameter => Err(HalError::InvalidParameter),
            HalStatus::ItemNotFound => Err(HalError::UnknownObject),
            HalStatus::ObjectInUse => Err(HalError::ObjectInUse),
            HalStatus::Failure => Err(HalError::Hardware(self)),
        }
    }
}

/// Errors surfaced by [`crate::FlowHal`] implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HalError {
    /// Device has no room for another object of the requested class.
    #[error("out of hardware resources ({0:?})")]
    OutOfResources(HalStatus),
    /// A handle did not refer to a live object.
    #[error("unknown hardware object")]
    UnknownObject,
    /// The object still has dependents.
    #[error("hardware object still in use")]
    ObjectInUse,
    /// The device rejected the request contents.
    #[error("invalid parameter")]
    InvalidParameter,
    /// Any other device-side failure.
    #[error("hardware failure ({0:?})")]
    Hardware(HalStatus),
}

/// Result alias for hardware calls.
pub type HalResult<T> = Result<T, HalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_status_round_trip() {
        assert_eq!(HalStatus::from_raw(0), HalStatus::Success);
        assert_eq!(HalStatus::from_raw(-3), HalStatus::InsufficientResources);
        assert_eq!(HalStatus::from_raw(-99), HalStatus::Failure);
    }

    #[test]
    fn status_to_result() {
        assert!(HalStatus::Success.into_result().is_ok());
        assert_eq!(
            HalStatus::NoMemory.into_result(),
            Err(HalError::OutOfResources(HalStatus::NoMemory))
        );
        assert_eq!(
            HalStatus::ObjectInUse.into_result(),
            Err(HalError::ObjectInUse)
        );
    }
}
