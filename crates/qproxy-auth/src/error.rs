/// Selection failures surfaced to the ingress layer unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    /// No candidate passed the availability filter.
    #[error("no auth available")]
    AuthNotFound,
}
