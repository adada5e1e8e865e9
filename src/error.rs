//! Common error definitions.

use crate::{
    cordic::CordicError, dac::DacError, dcmi::DcmiError, dma::DmaError, sai::SaiError,
    timer::TimerError,
};

macro_rules! impl_from_error {
    ($error:ident) => {
        impl From<$error> for Error {
            fn from(error: $error) -> Self {
                Self::$error(error)
            }
        }
    };
}

/// Alias for Result<T, Error>.
pub type Result<T> = core::result::Result<T, Error>;

/// Collection of all errors that can occur.
#[derive(Debug, Clone, Copy, Eq, PartialEq, defmt::Format)]
pub enum Error {
    /// The handle isn't in a state that allows this operation; eg starting a transfer while
    /// one is already running.
    Busy,
    /// An argument was out of range, or a buffer was empty or the wrong size.
    InvalidParam,
    /// A tick-based timeout expired before the hardware responded.
    Timeout,
    /// Occurs when an expected change of a register does happen in time.
    ///
    /// This is returned when a bounded loop exceeds its alotted iteration count.
    RegisterUnchanged,
    /// Direct Memory Access (DMA) error
    DmaError(DmaError),
    CordicError(CordicError),
    DacError(DacError),
    DcmiError(DcmiError),
    /// Serial audio interface errors.
    SaiError(SaiError),
    TimerError(TimerError),
}

impl_from_error!(DmaError);
impl_from_error!(CordicError);
impl_from_error!(DacError);
impl_from_error!(DcmiError);
impl_from_error!(SaiError);
impl_from_error!(TimerError);

#[cfg(feature = "embedded_hal")]
mod embedded_io_impl {
    use embedded_hal::pwm::{Error as PwmEhError, ErrorKind as PwmErrorKind};
    use embedded_io::{Error as IoError, ErrorKind as IoErrorKind};

    use super::{Error, SaiError};

    impl PwmEhError for Error {
        fn kind(&self) -> PwmErrorKind {
            PwmErrorKind::Other
        }
    }

    impl IoError for Error {
        fn kind(&self) -> IoErrorKind {
            match self {
                Error::Timeout | Error::RegisterUnchanged => IoErrorKind::TimedOut,
                Error::InvalidParam => IoErrorKind::InvalidInput,
                Error::SaiError(s) => match s {
                    SaiError::Overrun => IoErrorKind::OutOfMemory,
                    SaiError::Underrun => IoErrorKind::WriteZero,
                    _ => IoErrorKind::Other,
                },
                _ => IoErrorKind::Other,
            }
        }
    }
}
