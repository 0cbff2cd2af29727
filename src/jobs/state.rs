//! Per-job run-state machine.
//!
//! ```text
//! NONE --trigger--> WAITING --start--> RUNNING --done--------> DONE
//!                        |                 |   --error--> ERROR
//!                        |                 |   --abort--> ABORTED
//!                        |                 +--request credential--> REQUEST_*_PASSWORD --resume--> RUNNING
//!                        |                 +--request media--> REQUEST_VOLUME --resume--> RUNNING
//!                        +--abort before start--> NONE
//! remote-only: --connection lost--> DISCONNECTED
//! ```

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    None,
    Waiting,
    Running,
    RequestFtpPassword,
    RequestSshPassword,
    RequestWebdavPassword,
    RequestCryptPassword,
    RequestVolume,
    Done,
    Error,
    Aborted,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Ftp,
    Ssh,
    Webdav,
    Crypt,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot {action} from state {from:?}")]
    InvalidTransition {
        action: &'static str,
        from: JobState,
    },
}

use thiserror::Error;

/// The run-state machine for one job, separate from the job's static
/// configuration. Mirrors `JobNode`'s `state` field plus the fields the
/// transitions touch.
#[derive(Debug, Clone)]
pub struct RunState {
    state: JobState,
    pending_abort: bool,
}

impl Default for RunState {
    fn default() -> Self {
        RunState {
            state: JobState::None,
            pending_abort: false,
        }
    }
}

impl RunState {
    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, JobState::None | JobState::Done | JobState::Error | JobState::Aborted)
    }

    pub fn pending_abort(&self) -> bool {
        self.pending_abort
    }

    /// `NONE -> WAITING`: records the trigger and resets per-run state.
    pub fn trigger(&mut self) -> Result<(), TransitionError> {
        if self.state != JobState::None {
            return Err(TransitionError::InvalidTransition { action: "trigger", from: self.state });
        }
        self.state = JobState::Waiting;
        self.pending_abort = false;
        Ok(())
    }

    /// `WAITING -> RUNNING`.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        if self.state != JobState::Waiting {
            return Err(TransitionError::InvalidTransition { action: "start", from: self.state });
        }
        self.state = JobState::Running;
        Ok(())
    }

    /// `RUNNING -> REQUEST_{FTP,SSH,WEBDAV,CRYPT}_PASSWORD` or
    /// `REQUEST_VOLUME`, waiting on external input.
    pub fn request_credential(&mut self, kind: CredentialKind) -> Result<(), TransitionError> {
        if self.state != JobState::Running {
            return Err(TransitionError::InvalidTransition { action: "request_credential", from: self.state });
        }
        self.state = match kind {
            CredentialKind::Ftp => JobState::RequestFtpPassword,
            CredentialKind::Ssh => JobState::RequestSshPassword,
            CredentialKind::Webdav => JobState::RequestWebdavPassword,
            CredentialKind::Crypt => JobState::RequestCryptPassword,
        };
        Ok(())
    }

    pub fn request_volume(&mut self) -> Result<(), TransitionError> {
        if self.state != JobState::Running {
            return Err(TransitionError::InvalidTransition { action: "request_volume", from: self.state });
        }
        self.state = JobState::RequestVolume;
        Ok(())
    }

    /// Resumes from any `REQUEST_*` state back to `RUNNING` once the caller
    /// supplies the missing credential or media.
    pub fn resume(&mut self) -> Result<(), TransitionError> {
        use JobState::*;
        match self.state {
            RequestFtpPassword | RequestSshPassword | RequestWebdavPassword | RequestCryptPassword | RequestVolume => {
                self.state = Running;
                Ok(())
            }
            _ => Err(TransitionError::InvalidTransition { action: "resume", from: self.state }),
        }
    }

    /// Marks a running (or waiting) job for cooperative cancellation. The
    /// worker thread observes `pending_abort` at its next check and calls
    /// [`RunState::end`] with `aborted = true`.
    pub fn abort(&mut self) -> Result<(), TransitionError> {
        match self.state {
            JobState::Waiting => {
                self.state = JobState::None;
                Ok(())
            }
            JobState::Running
            | JobState::RequestFtpPassword
            | JobState::RequestSshPassword
            | JobState::RequestWebdavPassword
            | JobState::RequestCryptPassword
            | JobState::RequestVolume => {
                self.pending_abort = true;
                Ok(())
            }
            _ => Err(TransitionError::InvalidTransition { action: "abort", from: self.state }),
        }
    }

    pub fn disconnect(&mut self) -> Result<(), TransitionError> {
        if self.state != JobState::Running {
            return Err(TransitionError::InvalidTransition { action: "disconnect", from: self.state });
        }
        self.state = JobState::Disconnected;
        Ok(())
    }

    pub fn reconnect(&mut self) -> Result<(), TransitionError> {
        if self.state != JobState::Disconnected {
            return Err(TransitionError::InvalidTransition { action: "reconnect", from: self.state });
        }
        self.state = JobState::Running;
        Ok(())
    }

    /// `RUNNING -> DONE/ERROR/ABORTED`, based on whether the run produced
    /// an error and whether an abort was pending.
    pub fn end(&mut self, had_error: bool) -> Result<JobState, TransitionError> {
        if !self.is_active() {
            return Err(TransitionError::InvalidTransition { action: "end", from: self.state });
        }
        let final_state = if self.pending_abort {
            JobState::Aborted
        } else if had_error {
            JobState::Error
        } else {
            JobState::Done
        };
        self.state = final_state;
        self.pending_abort = false;
        Ok(final_state)
    }

    /// Resets back to `NONE`. Only valid outside active states.
    pub fn reset(&mut self) -> Result<(), TransitionError> {
        if self.is_active() {
            return Err(TransitionError::InvalidTransition { action: "reset", from: self.state });
        }
        self.state = JobState::None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_to_done() {
        let mut rs = RunState::default();
        rs.trigger().unwrap();
        rs.start().unwrap();
        assert_eq!(rs.end(false).unwrap(), JobState::Done);
    }

    #[test]
    fn error_path() {
        let mut rs = RunState::default();
        rs.trigger().unwrap();
        rs.start().unwrap();
        assert_eq!(rs.end(true).unwrap(), JobState::Error);
    }

    #[test]
    fn abort_while_running_yields_aborted_on_end() {
        let mut rs = RunState::default();
        rs.trigger().unwrap();
        rs.start().unwrap();
        rs.abort().unwrap();
        assert!(rs.pending_abort());
        assert_eq!(rs.end(false).unwrap(), JobState::Aborted);
    }

    #[test]
    fn abort_before_start_returns_to_none_directly() {
        let mut rs = RunState::default();
        rs.trigger().unwrap();
        rs.abort().unwrap();
        assert_eq!(rs.state(), JobState::None);
    }

    #[test]
    fn credential_request_then_resume() {
        let mut rs = RunState::default();
        rs.trigger().unwrap();
        rs.start().unwrap();
        rs.request_credential(CredentialKind::Ssh).unwrap();
        assert_eq!(rs.state(), JobState::RequestSshPassword);
        rs.resume().unwrap();
        assert_eq!(rs.state(), JobState::Running);
    }

    #[test]
    fn reset_rejected_while_active() {
        let mut rs = RunState::default();
        rs.trigger().unwrap();
        assert!(rs.reset().is_err());
    }

    #[test]
    fn reset_allowed_after_done() {
        let mut rs = RunState::default();
        rs.trigger().unwrap();
        rs.start().unwrap();
        rs.end(false).unwrap();
        rs.reset().unwrap();
        assert_eq!(rs.state(), JobState::None);
    }
}
