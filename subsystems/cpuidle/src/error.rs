//! # Error Handling
//!
//! The selection and reflection paths never fail: every degenerate input maps
//! to state 0. Errors only exist on the administrative surface (tunables,
//! depth caps, cluster overrides, device lifecycle), where a bad request is
//! rejected and the governor state is left untouched.
//!
//! ## Error Categories
//!
//! | Category | Codes   | Example                                  |
//! |----------|---------|------------------------------------------|
//! | General  | 0-99    | Unknown tunable name                     |
//! | Device   | 100-199 | CPU out of range, device not enabled     |
//! | State    | 200-299 | Idle state index beyond the driver table |
//! | Config   | 300-399 | Tunable value outside its range          |

use core::fmt;

// =============================================================================
// ERROR KIND
// =============================================================================

/// Classification of governor errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorKind {
    // -------------------------------------------------------------------------
    // General Errors (0-99)
    // -------------------------------------------------------------------------
    /// Invalid argument provided
    InvalidArgument     = 0,

    /// Named item does not exist
    NotFound            = 1,

    /// Text input could not be parsed
    ParseFailed         = 2,

    // -------------------------------------------------------------------------
    // Device Errors (100-199)
    // -------------------------------------------------------------------------
    /// CPU number beyond the governor's capacity
    InvalidCpu          = 100,

    /// Operation requires an enabled device
    DeviceNotEnabled    = 101,

    /// Device already enabled on this CPU
    DeviceAlreadyEnabled = 102,

    /// Cluster id beyond the governor's capacity
    InvalidCluster      = 103,

    // -------------------------------------------------------------------------
    // State Errors (200-299)
    // -------------------------------------------------------------------------
    /// Idle state index out of range
    InvalidState        = 200,

    /// Driver table is empty or larger than supported
    InvalidStateTable   = 201,

    // -------------------------------------------------------------------------
    // Config Errors (300-399)
    // -------------------------------------------------------------------------
    /// Tunable value outside its accepted range
    OutOfRange          = 300,

    /// Value conflicts with another tunable
    Conflict            = 301,
}

impl ErrorKind {
    /// Category name used as the display prefix
    pub const fn category(&self) -> &'static str {
        match *self as u32 {
            0..=99 => "general",
            100..=199 => "device",
            200..=299 => "state",
            _ => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// =============================================================================
// GOVERNOR ERROR
// =============================================================================

/// Error returned by the administrative surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorError {
    kind: ErrorKind,
    message: &'static str,
    cpu: Option<u32>,
    state: Option<usize>,
}

impl GovernorError {
    /// Create new error with kind and message
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self {
            kind,
            message,
            cpu: None,
            state: None,
        }
    }

    /// Attach the CPU the request targeted
    pub const fn with_cpu(mut self, cpu: u32) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// Attach the idle state index the request targeted
    pub const fn with_state(mut self, state: usize) -> Self {
        self.state = Some(state);
        self
    }

    /// Error classification
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Static description
    pub const fn message(&self) -> &'static str {
        self.message
    }

    /// CPU context, if any
    pub const fn cpu(&self) -> Option<u32> {
        self.cpu
    }

    /// Idle state context, if any
    pub const fn state(&self) -> Option<usize> {
        self.state
    }

    /// Numeric code for external reference
    pub const fn code(&self) -> u32 {
        self.kind as u32
    }
}

impl fmt::Display for GovernorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.category(), self.message)?;

        if let Some(cpu) = self.cpu {
            write!(f, " (cpu: {})", cpu)?;
        }

        if let Some(state) = self.state {
            write!(f, " (state: {})", state)?;
        }

        Ok(())
    }
}

/// Result alias for administrative operations
pub type GovernorResult<T> = Result<T, GovernorError>;

// =============================================================================
// TESTS
// =============================================================================
