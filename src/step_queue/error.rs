use crate::error::Error;

/// Ways a task operation can fail.
///
/// The state-machine variants are local guards; `Database` transparently
/// carries pool and driver errors, which the queue never retries on its
/// own.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// A guarded UPDATE affected zero rows: the task is gone, was claimed
    /// by someone else, or this handler's claim expired.
    #[error("task does not exist or this claim is no longer live")]
    TaskDoesNotExist,

    /// The handler already finished this task.
    #[error("task is already finished")]
    AlreadyFinished,

    /// A step of this name is already running.
    #[error("step is already started")]
    StepAlreadyStarted,

    /// A step of this name already ran to completion.
    #[error("step is already finished")]
    StepAlreadyFinished,

    /// A step of this name was never started.
    #[error("step was not started")]
    StepNotStarted,

    /// The task cannot finish or requeue while a step is unstopped.
    #[error("a step is still running")]
    StepRunning,

    #[error(transparent)]
    Database(#[from] Error),
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> TaskError {
        TaskError::Database(Error::from(err))
    }
}
