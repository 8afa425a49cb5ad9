//! Unit claiming.
//!
//! A driver step starts by claiming the lowest-order pending unit of a
//! document. The store performs the `pending → processing` flip in a single
//! conditional statement, so among concurrent callers exactly one receives
//! a given unit. Store failures come back as [`PipelineError::Claim`] and are
//! never retried here; the dispatcher backs off instead.

use crate::error::{PipelineError, PipelineResult};
use crate::models::AnalysisUnit;
use crate::store::UnitStore;

pub async fn claim_next_unit(
    store: &dyn UnitStore,
    document_id: &str,
) -> PipelineResult<Option<AnalysisUnit>> {
    let now = chrono::Utc::now().timestamp();
    match store.claim_next_unit(document_id, now).await {
        Ok(Some(unit)) => {
            tracing::info!(
                document_id,
                unit_id = %unit.id,
                stage = %unit.stage_title,
                order = unit.execution_order,
                "claimed unit"
            );
            Ok(Some(unit))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(PipelineError::Claim {
            document_id: document_id.to_string(),
            message: format!("{:#}", e),
        }),
    }
}
