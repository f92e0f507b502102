//! Core types and traits for the Pariksha validation system.
//!
//! This module contains the foundational types shared by every layer:
//! - Records and validation requests
//! - Issues, aspect results and scoring
//! - Settings and the settings collaborator
//! - Error types
//! - Event bus and aspect contexts
//! - Contracts for external collaborators

pub mod types;
pub mod record;
pub mod error;
pub mod settings;
pub mod context;
pub mod events;
pub mod services;

// Re-export commonly used types
pub use types::{
    Aspect, AspectResult, IssueCounts, RequestContext, RetryInfo, Severity, ValidationIssue,
    ValidationRequest, ValidationResult, ValidationTiming,
};
pub use record::Record;
pub use error::{AspectError, ControlError, RecordError, SettingsError, SystemError};
pub use settings::{SettingsEvent, SettingsService, StaticSettingsService, ValidationSettings};
pub use context::{AspectContext, AspectResources};
pub use events::EventBus;
