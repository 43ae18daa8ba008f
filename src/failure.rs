//! Definitions for dealing with an [`Error`] encountered by a
//! [`metrics::Recorder`].
//!
//! [`Error`]: crate::Error

#[doc(inline)]
pub use self::strategy::Strategy;

/// Possible actions on an [`Error`] encountered inside [`metrics::Recorder`]
/// methods.
///
/// [`Error`]: crate::Error
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    /// Return a no-op metric implementation (see [`metrics::Counter::noop()`]
    /// for example).
    NoOp,

    /// Panic with the encountered [`Error`](crate::Error).
    Panic,
}

/// Strategies for dealing with an [`Error`].
///
/// [`Error`]: crate::Error
pub mod strategy {
    use crate::Error;

    use super::Action;

    /// Strategy deciding which [`Action`] should be performed on an [`Error`]
    /// encountered inside [`metrics::Recorder`] methods.
    pub trait Strategy {
        /// Inspects the encountered [`Error`] and returns the [`Action`] to be
        /// performed.
        fn decide(&self, err: &Error) -> Action;
    }

    /// [`Strategy`] returning always [`Action::NoOp`].
    #[derive(Clone, Copy, Debug, Default)]
    pub struct NoOp;

    impl Strategy for NoOp {
        fn decide(&self, _: &Error) -> Action {
            Action::NoOp
        }
    }

    /// [`Strategy`] returning always [`Action::Panic`].
    #[derive(Clone, Copy, Debug, Default)]
    pub struct Panic;

    impl Strategy for Panic {
        fn decide(&self, _: &Error) -> Action {
            Action::Panic
        }
    }

    /// [`Strategy`] returning an [`Action::Panic`] in debug mode, and
    /// [`Action::NoOp`] in release mode.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct PanicInDebugNoOpInRelease;

    impl Strategy for PanicInDebugNoOpInRelease {
        fn decide(&self, _: &Error) -> Action {
            #[cfg(debug_assertions)]
            {
                Action::Panic
            }
            #[cfg(not(debug_assertions))]
            {
                Action::NoOp
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        strategy::{NoOp, Panic, PanicInDebugNoOpInRelease},
        Action, Strategy,
    };
    use crate::Error;

    #[test]
    fn decides_regardless_of_error() {
        let err = Error::EmptyCollector;

        assert_eq!(NoOp.decide(&err), Action::NoOp);
        assert_eq!(Panic.decide(&err), Action::Panic);
        assert_eq!(
            PanicInDebugNoOpInRelease.decide(&err),
            if cfg!(debug_assertions) { Action::Panic } else { Action::NoOp },
        );
    }
}
