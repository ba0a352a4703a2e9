//! Typed failures of a benchmark run.
//!
//! Orchestration code works with `anyhow::Result` and attaches context as
//! errors bubble up. The variants below are the conditions callers (and
//! tests) need to tell apart: precondition violations, protocol mismatches,
//! incomplete task sets and backend failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchError {
    /// A window of zero would never send a probe.
    #[error("window must be at least 1")]
    ZeroWindow,

    /// The window can never be filled with the requested number of probes.
    #[error("window ({window}) must not exceed the number of pings ({num_pings})")]
    WindowExceedsPings { window: usize, num_pings: u64 },

    /// A freshly added account already carries a configuration.
    #[error("account {account} is already configured")]
    AlreadyConfigured { account: u32 },

    /// The pong account has no address to create a contact from.
    #[error("account {account} has no configured address")]
    MissingAddress { account: u32 },

    /// Neither a chatmail domain nor a temporary-account URL was given.
    #[error("no credential source: set CHATMAIL_DOMAIN or DCC_NEW_TMP_EMAIL")]
    MissingCredentialSource,

    /// An echo that does not match any probe in flight.
    #[error("unexpected echo {payload:?}")]
    UnexpectedEcho { payload: String },

    /// The wait-for-all step finished with tasks still pending.
    #[error("{phase}: {pending} of {total} tasks did not complete")]
    IncompleteTasks {
        phase: &'static str,
        pending: usize,
        total: usize,
    },

    /// The backend answered a call with an error object.
    #[error("rpc call {method} failed ({code}): {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    /// The backend connection went away.
    #[error("backend connection closed")]
    BackendClosed,

    #[error("account {account} has no chat {chat}")]
    UnknownChat { account: u32, chat: u32 },

    #[error("account {account} has no message {msg}")]
    UnknownMessage { account: u32, msg: u32 },

    #[error("account {account} is not configured")]
    NotConfigured { account: u32 },

    #[error("account {account} has not started I/O")]
    IoNotStarted { account: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_error_message() {
        let err = BenchError::WindowExceedsPings {
            window: 4,
            num_pings: 2,
        };
        assert_eq!(
            err.to_string(),
            "window (4) must not exceed the number of pings (2)"
        );
    }

    #[test]
    fn test_errors_downcast_through_anyhow() {
        let err: anyhow::Error = BenchError::ZeroWindow.into();
        assert!(matches!(
            err.downcast_ref::<BenchError>(),
            Some(BenchError::ZeroWindow)
        ));
    }
}
