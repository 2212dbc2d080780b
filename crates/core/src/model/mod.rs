mod answer;
mod attempt;
mod ids;
mod settings;

pub use answer::AnswerValue;
pub use ids::{AttemptId, OptionId, ParseIdError, QuestionId, TestId, UserId};

pub use attempt::{
    AttemptError, AttemptParts, AttemptStatus, QuestionNavStatus, TestAttemptSession, TimeCharge,
};
pub use settings::{SessionSettings, SettingsError};
