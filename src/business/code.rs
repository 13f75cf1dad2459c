//! Error-code catalogues.
//!
//! Every code carries the HTTP status it maps to, a stable string code
//! (`C-…` common, `R-…` challenge, `M-…` comment, `L-…` comment like) and
//! the message reported to clients.

use std::fmt;

/// A structured, client-facing error code.
pub trait ErrorCode: fmt::Debug + Send + Sync {
    fn status(&self) -> u16;
    fn code(&self) -> &'static str;
    fn message(&self) -> &'static str;
}

macro_rules! error_codes {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $variant:ident => ($status:literal, $code:literal, $message:literal) ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $( $variant ),*
        }

        impl $name {
            pub const ALL: &'static [$name] = &[ $( $name::$variant ),* ];
        }

        impl ErrorCode for $name {
            fn status(&self) -> u16 {
                match self {
                    $( $name::$variant => $status ),*
                }
            }

            fn code(&self) -> &'static str {
                match self {
                    $( $name::$variant => $code ),*
                }
            }

            fn message(&self) -> &'static str {
                match self {
                    $( $name::$variant => $message ),*
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "[{}] {}", self.code(), self.message())
            }
        }
    };
}

error_codes! {
    /// Errors any endpoint can raise.
    pub enum CommonErrorCode {
        InternalServerError => (500, "C-000", "An internal server error occurred."),
        BadRequest => (400, "C-001", "Bad request."),
        InvalidInputValue => (400, "C-002", "Invalid input value."),
        TypeMismatch => (400, "C-003", "Input type mismatch."),
        MissingRequestParams => (400, "C-004", "Request parameters are required."),
        Unauthorized => (401, "C-005", "Login is required."),
        NotFound => (404, "C-006", "Resource not found."),
        MethodNotAllowed => (405, "C-007", "HTTP method not allowed."),
        Forbidden => (403, "C-008", "Access is not allowed."),
        MediaNotSupported => (415, "C-009", "Unsupported media type."),
    }
}

error_codes! {
    pub enum ChallengeRoomErrorCode {
        NotFoundUser => (404, "R-001", "User not found."),
        NotFoundRoom => (404, "R-002", "Challenge room not found."),
        InvalidAuthUser => (400, "R-003", "User is not authorized."),
        FailedDeleteRoom => (400, "R-004", "Failed to delete the room."),
    }
}

error_codes! {
    pub enum ChallengeParticipantErrorCode {
        NotFoundUser => (404, "R-500", "User not found."),
        CannotFindChallengeRoom => (404, "R-501", "Challenge room not found."),
        AlreadyJoined => (400, "R-502", "User has already joined this challenge."),
        FullJoinedRoom => (400, "R-503", "The challenge is full."),
        NoParticipantInRoom => (400, "R-504", "User is not a participant of this challenge."),
    }
}

error_codes! {
    pub enum ChallengeVideoErrorCode {
        NotFoundUser => (404, "R-600", "User not found."),
        CannotFindChallengeRoom => (404, "R-601", "Challenge room not found."),
        InvalidVideoFormat => (400, "R-602", "Invalid video format."),
        DuplicateVideoInRoom => (400, "R-603", "This video was already uploaded to the room."),
        VideoNotFoundOrForbidden => (404, "R-604", "Video not found or access is forbidden."),
        UserNotParticipantInRoom => (401, "R-605", "User is not a participant of the room."),
    }
}

error_codes! {
    pub enum ChallengeMissionErrorCode {
        NotFoundUser => (404, "R-700", "User not found."),
        NotFoundVideo => (404, "R-701", "Challenge video not found."),
        NotInitializedMission => (400, "R-702", "Today's mission has not been initialized."),
        InvalidRoomAccess => (403, "R-703", "The challenge room cannot be accessed."),
        AlreadyCompleted => (400, "R-704", "Today's mission is already completed."),
        NoVideoUploaded => (400, "R-705", "No video has been uploaded for today's mission."),
    }
}

error_codes! {
    pub enum CommentErrorCode {
        WrongAccess => (403, "M-101", "This comment was written by another user."),
        CommentNotFound => (404, "M-102", "Comment not found."),
        RoomNotFound => (404, "M-103", "Challenge room not found."),
        UserNotFound => (404, "M-104", "User not found."),
        InappropriateContentWarn => (422, "M-105", "This may come across as offensive. Please rephrase it more gently."),
        InappropriateContentBlock => (403, "M-106", "Strong profanity or demeaning language is not allowed."),
    }
}

error_codes! {
    pub enum CommentLikeErrorCode {
        CommentNotFound => (404, "L-301", "Comment not found."),
        LikeToggleFailed => (409, "L-302", "The like conflicted with a concurrent update. Please try again."),
    }
}
