#![forbid(unsafe_code)]

pub mod api;
pub mod app_services;
pub mod config;
pub mod error;
pub mod sessions;

pub use exam_core::Clock;

pub use api::{AttemptApi, HttpAttemptApi, InMemoryAttemptApi, SessionRecord, SubmitResult};
pub use app_services::AppServices;
pub use config::ApiConfig;
pub use error::{ApiError, AppServicesError, ConfigError, CoordinatorError, RegistryError, TimerError};

pub use sessions::{
    AttemptListItem, ResumeTarget, ResumptionRegistry, SaveStatus, SessionCoordinator,
    SessionEvent, SessionView,
};
