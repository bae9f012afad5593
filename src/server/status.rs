//! Shell response statuses. Negative codes are handshake states, 0 is a
//! normal response, positive codes are failures or terminal states.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    ModeChanged,
    Authorized,
    NotAuthorized,
    Response,
    Timeout,
    AuthorizeAgain,
    CommandNotFound,
    CommandMismatch,
    UnexpectedError,
    KeyNotExist,
    Exit,
    FullRoom,
    SizeLimit,
}

impl Status {
    /// The numeric status code carried in envelopes.
    pub fn code(self) -> i8 {
        match self {
            Status::ModeChanged => -3,
            Status::Authorized => -2,
            Status::NotAuthorized => -1,
            Status::Response => 0,
            Status::Timeout => 1,
            Status::AuthorizeAgain => 2,
            Status::CommandNotFound => 3,
            Status::CommandMismatch => 4,
            Status::UnexpectedError => 5,
            Status::KeyNotExist => 6,
            Status::Exit => 7,
            Status::FullRoom => 8,
            Status::SizeLimit => 9,
        }
    }

    /// The symbolic name carried in envelopes.
    pub fn symbol(self) -> &'static str {
        match self {
            Status::ModeChanged => "mode_changed",
            Status::Authorized => "authorized",
            Status::NotAuthorized => "not_authorized",
            Status::Response => "response",
            Status::Timeout => "timeout",
            Status::AuthorizeAgain => "authorize_again",
            Status::CommandNotFound => "command_not_found",
            Status::CommandMismatch => "command_mismatch",
            Status::UnexpectedError => "unexpected_error",
            Status::KeyNotExist => "key_not_exist",
            Status::Exit => "exit",
            Status::FullRoom => "full_room",
            Status::SizeLimit => "size_limit",
        }
    }

    /// Whether the status represents success.
    pub fn success(self) -> bool {
        matches!(
            self,
            Status::ModeChanged
                | Status::Authorized
                | Status::NotAuthorized
                | Status::Response
                | Status::Exit
        )
    }
}
