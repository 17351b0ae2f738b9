//! Commit-or-rollback for a finished unit of work.

use murmur_db::StoreTx;

use crate::error::SocialError;

/// Commit `tx` if `result` is `Ok`, otherwise roll it back before handing
/// the error to the caller.
///
/// A failed rollback is logged and the original error wins.
pub(crate) async fn settle<T>(
    tx: StoreTx,
    result: Result<T, SocialError>,
) -> Result<T, SocialError> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}
