use async_trait::async_trait;
use taskgate_domain::Assertion;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssertionCheck {
    Passed,
    NotFound(String),
    TimedOut,
}

/// Checks a post-condition after a tool call, honoring the assertion's own timeout.
#[async_trait]
pub trait AssertionVerifier: Send + Sync {
    async fn verify(&self, assertion: &Assertion) -> AssertionCheck;
}

/// Used when nothing can observe tool effects; every assertion fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableVerifier;

#[async_trait]
impl AssertionVerifier for UnavailableVerifier {
    async fn verify(&self, assertion: &Assertion) -> AssertionCheck {
        AssertionCheck::NotFound(format!(
            "no verifier available for {}",
            assertion.kind.as_str()
        ))
    }
}
