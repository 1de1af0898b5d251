use std::fmt;

/// Job state as reported by `get_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    TaskNotFound,
    Pending,
    RequestModerated,
    ContentModerated,
    Ready,
    Error,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::TaskNotFound,
        Status::Pending,
        Status::RequestModerated,
        Status::ContentModerated,
        Status::Ready,
        Status::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::TaskNotFound => "Task not found",
            Status::Pending => "Pending",
            Status::RequestModerated => "Request Moderated",
            Status::ContentModerated => "Content Moderated",
            Status::Ready => "Ready",
            Status::Error => "Error",
        }
    }

    /// Case-insensitive match against the wire strings. `failed` is accepted
    /// as an alias of `Error`. Anything else is `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        if lowered == "failed" {
            return Some(Status::Error);
        }
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(&lowered))
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Ready)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
