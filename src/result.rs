/// Result type.
///
/// Errors are [`anyhow::Error`] unless a module needs a typed error, like
/// [`IdxError`](crate::dataset::idx::IdxError).
pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
