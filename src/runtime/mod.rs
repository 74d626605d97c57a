//! Language runtimes and execution sessions

pub mod driver;
pub mod language;
pub mod process;
pub mod registry;
pub mod result;
pub mod session;

pub use language::Language;
pub use registry::{program_available, HealthReport, LanguageHealth, RuntimeRegistry, SessionLease};
pub use result::{BlockRef, ExecErrorKind, ExecutionResult, ExecutionStatus, OutputSegment};
pub use session::{ExecEvent, ExecLimits, ExecOutcome, Session, SessionKey, SessionState};
