//! Outcome classification for protected calls
//!
//! A failed call is either recorded as a failure, ignored entirely (counted
//! as neither success nor failure), or treated as a success. A successful
//! value may still be recorded as a failure through a [`ResultPredicate`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Context provided to classifiers for error evaluation
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Name of the protecting component
    pub name: &'a str,
    /// The error that occurred (can be downcast to specific types)
    pub error: &'a dyn Any,
    /// Duration of the failed call
    pub duration: Duration,
}

/// How an error counts toward the metrics window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Counted as a failure
    Record,
    /// Counted as nothing, published as an ignored error
    Ignore,
    /// Counted as a success
    Success,
}

/// Decides how an error counts toward a component's metrics
///
/// # Examples
///
/// ```rust
/// use resilience_machines::{Classification, FailureClassifier, FailureContext};
///
/// #[derive(Debug)]
/// struct ServerErrorClassifier;
///
/// impl FailureClassifier for ServerErrorClassifier {
///     fn classify(&self, ctx: &FailureContext<'_>) -> Classification {
///         match ctx.error.downcast_ref::<u16>() {
///             Some(status) if *status < 500 => Classification::Ignore,
///             _ => Classification::Record,
///         }
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + fmt::Debug {
    fn classify(&self, ctx: &FailureContext<'_>) -> Classification;
}

/// Default classifier that records every error
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn classify(&self, _ctx: &FailureContext<'_>) -> Classification {
        Classification::Record
    }
}

/// Predicate-based classifier using a closure
///
/// Errors matching the predicate are recorded, the rest are ignored.
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn classify(&self, ctx: &FailureContext<'_>) -> Classification {
        if (self.predicate)(ctx) {
            Classification::Record
        } else {
            Classification::Ignore
        }
    }
}

impl<F> fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}

type ErrorPredicate = Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>;

/// Record/ignore predicate pair
///
/// The ignore predicate wins over the record predicate. Errors matched by
/// neither count as successes.
#[derive(Clone, Default)]
pub struct ExceptionClassifier {
    record: Option<ErrorPredicate>,
    ignore: Option<ErrorPredicate>,
}

impl ExceptionClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record errors of type `E` matching `predicate`
    pub fn record_if<E, F>(mut self, predicate: F) -> Self
    where
        E: 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.record = Some(Arc::new(move |error: &dyn Any| {
            error.downcast_ref::<E>().is_some_and(&predicate)
        }));
        self
    }

    /// Ignore errors of type `E` matching `predicate`
    pub fn ignore_if<E, F>(mut self, predicate: F) -> Self
    where
        E: 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.ignore = Some(Arc::new(move |error: &dyn Any| {
            error.downcast_ref::<E>().is_some_and(&predicate)
        }));
        self
    }
}

impl FailureClassifier for ExceptionClassifier {
    fn classify(&self, ctx: &FailureContext<'_>) -> Classification {
        if self.ignore.as_ref().is_some_and(|p| p(ctx.error)) {
            return Classification::Ignore;
        }
        match &self.record {
            None => Classification::Record,
            Some(p) if p(ctx.error) => Classification::Record,
            Some(_) => Classification::Success,
        }
    }
}

impl fmt::Debug for ExceptionClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionClassifier")
            .field("record", &self.record.is_some())
            .field("ignore", &self.ignore.is_some())
            .finish()
    }
}

/// Decides whether a successful return value counts as a failure
#[derive(Clone)]
pub struct ResultPredicate(Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>);

impl ResultPredicate {
    /// Match results of type `T`; values of any other type never match
    pub fn new<T, F>(predicate: F) -> Self
    where
        T: 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(move |value: &dyn Any| {
            value.downcast_ref::<T>().is_some_and(&predicate)
        }))
    }

    pub fn test(&self, value: &dyn Any) -> bool {
        (self.0)(value)
    }
}

impl fmt::Debug for ResultPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResultPredicate(<closure>)")
    }
}

/// Shared classifier handle stored in configs
pub(crate) fn default_classifier() -> Arc<dyn FailureClassifier> {
    Arc::new(DefaultClassifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct HttpError {
        status: u16,
    }

    fn ctx<'a>(error: &'a dyn Any, duration: Duration) -> FailureContext<'a> {
        FailureContext {
            name: "test",
            error,
            duration,
        }
    }

    #[test]
    fn test_default_classifier_records_all() {
        let classifier = DefaultClassifier;
        let error = "any error";

        assert_eq!(
            classifier.classify(&ctx(&error, Duration::ZERO)),
            Classification::Record
        );
    }

    #[test]
    fn test_predicate_classifier() {
        // Only slow errors count
        let classifier = PredicateClassifier::new(|ctx| ctx.duration > Duration::from_secs(1));
        let error = "timeout";

        assert_eq!(
            classifier.classify(&ctx(&error, Duration::from_millis(500))),
            Classification::Ignore
        );
        assert_eq!(
            classifier.classify(&ctx(&error, Duration::from_secs(2))),
            Classification::Record
        );
    }

    #[test]
    fn test_exception_classifier_ignore_wins() {
        let classifier = ExceptionClassifier::new()
            .record_if(|e: &HttpError| e.status >= 500)
            .ignore_if(|e: &HttpError| e.status == 503);

        let server = HttpError { status: 500 };
        let unavailable = HttpError { status: 503 };
        let client = HttpError { status: 404 };

        assert_eq!(
            classifier.classify(&ctx(&server, Duration::ZERO)),
            Classification::Record
        );
        assert_eq!(
            classifier.classify(&ctx(&unavailable, Duration::ZERO)),
            Classification::Ignore
        );
        assert_eq!(
            classifier.classify(&ctx(&client, Duration::ZERO)),
            Classification::Success
        );
    }

    #[test]
    fn test_exception_classifier_records_unknown_types_by_default() {
        let classifier = ExceptionClassifier::new().ignore_if(|e: &HttpError| e.status == 404);
        let other = std::io::Error::other("boom");

        assert_eq!(
            classifier.classify(&ctx(&other, Duration::ZERO)),
            Classification::Record
        );
    }

    #[test]
    fn test_result_predicate_downcasts() {
        let predicate = ResultPredicate::new(|status: &u16| *status >= 400);

        assert!(predicate.test(&500u16));
        assert!(!predicate.test(&200u16));
        assert!(!predicate.test(&"not a status"));
    }
}
