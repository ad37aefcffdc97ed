mod attempt;
mod job;
mod state;

pub use attempt::{Attempt, Confirmation, Evidence, Outcome, Step};
pub use job::{AnswerCategory, CandidateProfile, Job, PriorityClass, ResumeRef};
pub use state::{IllegalTransition, StateMachine, StepState};
