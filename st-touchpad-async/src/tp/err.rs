//! Error types for the touchpad driver.

use core::fmt::{self, Debug};

/// An error related to SPI communication.
pub enum SpiError<TSPIERR> {
    /// An error occurred during a write-only transaction.
    Write(TSPIERR),
    /// An error occurred during a transaction reading a response.
    Transfer(TSPIERR),
}

impl<TSPIERR: Debug> Debug for SpiError<TSPIERR> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write(err) => write!(f, "Write({err:?})"),
            Self::Transfer(err) => write!(f, "Transfer({err:?})"),
        }
    }
}

/// An error related to GPIO pin operations.
pub enum PinError<TPINERR> {
    /// An error occurred on the reset line.
    Output(TPINERR),
    /// An error occurred on the interrupt line.
    Input(TPINERR),
}

impl<TPINERR: Debug> Debug for PinError<TPINERR> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Output(err) => write!(f, "Output({err:?})"),
            Self::Input(err) => write!(f, "Input({err:?})"),
        }
    }
}

/// The main error type for the touchpad driver.
pub enum TpError<TSPIERR, TPINERR> {
    /// The bus exchange failed.
    Spi(SpiError<TSPIERR>),
    /// A pin could not be driven or sampled.
    Pin(PinError<TPINERR>),
    /// A bounded poll ran out of attempts.
    Timeout,
    /// The request was rejected before any I/O.
    InvalidArgument,
    /// The controller has not finished the current operation yet.
    Busy,
    /// The controller answered with an unexpected header.
    Protocol,
    /// The running firmware does not support the request.
    Unsupported,
    /// The controller reported an error that requires halting it.
    MajorFault {
        /// Error report type.
        report_type: u8,
        /// Error report information bytes.
        info: [u8; 4],
    },
    /// A firmware update or the following re-initialization is running.
    UpdateInProgress,
}

impl<TSPIERR: Debug, TPINERR: Debug> Debug for TpError<TSPIERR, TPINERR> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spi(err) => write!(f, "Spi({err:?})"),
            Self::Pin(err) => write!(f, "Pin({err:?})"),
            Self::Timeout => write!(f, "Timeout"),
            Self::InvalidArgument => write!(f, "InvalidArgument"),
            Self::Busy => write!(f, "Busy"),
            Self::Protocol => write!(f, "Protocol"),
            Self::Unsupported => write!(f, "Unsupported"),
            Self::MajorFault { report_type, info } => {
                write!(f, "MajorFault({report_type:#04x}, {info:02x?})")
            }
            Self::UpdateInProgress => write!(f, "UpdateInProgress"),
        }
    }
}

impl<TSPIERR, TPINERR> From<SpiError<TSPIERR>> for TpError<TSPIERR, TPINERR> {
    fn from(spi_err: SpiError<TSPIERR>) -> Self {
        TpError::Spi(spi_err)
    }
}

impl<TSPIERR, TPINERR> From<PinError<TPINERR>> for TpError<TSPIERR, TPINERR> {
    fn from(pin_err: PinError<TPINERR>) -> Self {
        TpError::Pin(pin_err)
    }
}
