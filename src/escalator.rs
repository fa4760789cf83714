//! Security escalation: retries a request once, at a higher security level,
//! when the peer rejects it for insufficient encryption or authentication.
//!
//! This is a thin wrapper around the pipeline, not a stateful component —
//! every caller that issues a retryable ATT request goes through
//! [`with_escalation`] instead of calling [`Pipeline::request`] directly.

use std::future::Future;

use crate::{codec, transport::SecurityGate, Error, ErrorKind, Result};

/// Issues `attempt` once; if it fails with an [`ErrorKind::AttError`] that
/// [`codec::is_escalatable`] recognises, raises `transport`'s security to
/// `escalated` and retries exactly once. A second failure (escalatable or
/// not) is returned to the caller as-is.
pub async fn with_escalation<F, Fut, T>(
    transport: &dyn SecurityGate, escalated: crate::l2cap::SecurityLevel, mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match attempt().await {
        Err(Error { kind: ErrorKind::AttError(code), .. }) if codec::is_escalatable(code) => {
            transport.set_security(escalated).await?;
            attempt().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l2cap::SecurityLevel;
    use std::cell::Cell;
    use std::pin::Pin;

    #[test]
    fn is_escalatable_recognises_insuff_enc_and_authentication() {
        assert!(codec::is_escalatable(codec::ATT_ERROR_INSUFF_ENC));
        assert!(codec::is_escalatable(codec::ATT_ERROR_AUTHENTICATION));
        assert!(!codec::is_escalatable(0x01));
    }

    /// Records every security level it was raised to; never fails.
    #[derive(Default)]
    struct FakeGate {
        raised_to: Cell<Vec<SecurityLevel>>,
    }

    impl SecurityGate for FakeGate {
        fn set_security<'a>(&'a self, level: SecurityLevel) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            let mut levels = self.raised_to.take();
            levels.push(level);
            self.raised_to.set(levels);
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn escalates_once_then_succeeds() {
        let gate = FakeGate::default();
        let attempts = Cell::new(0);
        let result = with_escalation(&gate, SecurityLevel::High, || {
            attempts.set(attempts.get() + 1);
            let n = attempts.get();
            async move { if n == 1 { Err(Error::new(ErrorKind::AttError(codec::ATT_ERROR_AUTHENTICATION))) } else { Ok(42) } }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.get(), 2, "attempt closure must run exactly twice: once, then once more after escalation");
        assert_eq!(gate.raised_to.take(), vec![SecurityLevel::High], "escalation must raise security exactly once");
    }

    #[tokio::test]
    async fn surfaces_error_after_second_failure() {
        let gate = FakeGate::default();
        let attempts = Cell::new(0);
        let result: Result<()> = with_escalation(&gate, SecurityLevel::High, || {
            attempts.set(attempts.get() + 1);
            async move { Err(Error::new(ErrorKind::AttError(codec::ATT_ERROR_AUTHENTICATION))) }
        })
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::AttError(codec::ATT_ERROR_AUTHENTICATION));
        assert_eq!(attempts.get(), 2, "no third attempt after the retry also fails");
    }

    #[tokio::test]
    async fn non_escalatable_error_is_surfaced_without_a_retry() {
        let gate = FakeGate::default();
        let attempts = Cell::new(0);
        let result: Result<()> = with_escalation(&gate, SecurityLevel::High, || {
            attempts.set(attempts.get() + 1);
            async move { Err(Error::new(ErrorKind::InvalidArgs)) }
        })
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::InvalidArgs);
        assert_eq!(attempts.get(), 1);
        assert!(gate.raised_to.take().is_empty());
    }
}
