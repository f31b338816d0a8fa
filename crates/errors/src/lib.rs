use std::borrow::Cow;

/// `ErrorMetadata` is attached to an `anyhow::Error` chain via `.context(..)`
/// so that callers near the edge of the system (the consumer loop) can
/// classify a failure without needing to know where it originated. See
/// `ErrorCode` for the classification this worker cares about.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    /// short ScreamingCamelCase, usable in tests and logs.
    pub short_msg: Cow<'static, str>,
    /// human readable, developer facing.
    pub msg: Cow<'static, str>,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The inbound payload itself was malformed (not JSON, not an array, a
    /// message missing required fields). The consumer loop rejects the
    /// delivery without requeueing it.
    BadRequest,
    /// A referenced entity (data type, metadata document) could not be
    /// found where the protocol assumes one exists.
    NotFound,
    /// A transient failure of a backend collaborator (store, cache, lock,
    /// registry refresh). The batch is requeued and retried.
    Overloaded,
    /// An internal failure serious enough that the process should not
    /// continue operating (e.g. failing to connect to the store at boot).
    OperationalInternalServerError,
}

impl ErrorMetadata {
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// A transient failure that should cause the current batch to be
    /// requeued. Use this, not a bare `anyhow!`, for anything the broker
    /// should retry.
    pub fn overloaded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn operational_internal_server_error() -> Self {
        Self {
            code: ErrorCode::OperationalInternalServerError,
            short_msg: INTERNAL_SERVER_ERROR.into(),
            msg: INTERNAL_SERVER_ERROR_MSG.into(),
        }
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    pub fn is_overloaded(&self) -> bool {
        self.code == ErrorCode::Overloaded
    }

    /// Whether the consumer loop should requeue the batch that produced
    /// this error (as opposed to dropping it).
    pub fn should_requeue(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::Overloaded | ErrorCode::OperationalInternalServerError
        )
    }

    pub fn should_report_to_sentry(&self) -> Option<sentry::Level> {
        match self.code {
            ErrorCode::BadRequest | ErrorCode::NotFound => Some(sentry::Level::Info),
            ErrorCode::Overloaded | ErrorCode::OperationalInternalServerError => {
                Some(sentry::Level::Warning)
            },
        }
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn is_bad_request(&self) -> bool;
    fn is_not_found(&self) -> bool;
    fn is_overloaded(&self) -> bool;
    fn should_requeue(&self) -> bool;
    fn should_report_to_sentry(&self) -> Option<sentry::Level>;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn is_bad_request(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_bad_request)
    }

    fn is_not_found(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_not_found)
    }

    fn is_overloaded(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_overloaded)
    }

    /// Errors with no attached `ErrorMetadata` are treated as transient by
    /// default -- an unclassified failure from a driver crate (Mongo, Redis,
    /// memcache, AMQP) is almost always worth retrying rather than dropping
    /// the batch on the floor.
    fn should_requeue(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .map_or(true, ErrorMetadata::should_requeue)
    }

    fn should_report_to_sentry(&self) -> Option<sentry::Level> {
        self.downcast_ref::<ErrorMetadata>()
            .map_or(Some(sentry::Level::Error), ErrorMetadata::should_report_to_sentry)
    }

    fn short_msg(&self) -> &str {
        self.downcast_ref::<ErrorMetadata>()
            .map_or(INTERNAL_SERVER_ERROR, |e| &e.short_msg)
    }

    fn msg(&self) -> &str {
        self.downcast_ref::<ErrorMetadata>()
            .map_or(INTERNAL_SERVER_ERROR_MSG, |e| &e.msg)
    }
}

pub const INTERNAL_SERVER_ERROR_MSG: &str = "An internal error occurred. Try again later.";
pub const INTERNAL_SERVER_ERROR: &str = "InternalServerError";

#[cfg(any(test, feature = "testing"))]
mod proptest_impls {
    use proptest::prelude::*;

    use super::{
        ErrorCode,
        ErrorMetadata,
    };

    impl Arbitrary for ErrorMetadata {
        type Parameters = ();

        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<ErrorCode>()
                .prop_map(|ec| match ec {
                    ErrorCode::BadRequest => ErrorMetadata::bad_request("bad", "request"),
                    ErrorCode::NotFound => ErrorMetadata::not_found("not", "found"),
                    ErrorCode::Overloaded => ErrorMetadata::overloaded("overloaded", "error"),
                    ErrorCode::OperationalInternalServerError => {
                        ErrorMetadata::operational_internal_server_error()
                    },
                })
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overloaded_requeues_bad_request_does_not() {
        let overloaded: anyhow::Error = ErrorMetadata::overloaded("Busy", "locked").into();
        assert!(overloaded.should_requeue());

        let bad_request: anyhow::Error = ErrorMetadata::bad_request("Bad", "nope").into();
        assert!(!bad_request.should_requeue());
    }

    #[test]
    fn unclassified_error_defaults_to_requeue() {
        let err = anyhow::anyhow!("boom");
        assert!(err.should_requeue());
    }
}
