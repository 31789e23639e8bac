//! Auto-load-on-inference policy.
//!
//! Inference endpoints call [`ensure_loaded`] before dispatching: a model
//! that is not resident gets looked up, downloaded if needed (cached path
//! preferred, no revision check), and loaded with empty override options.
//! Only the explicit `/pull` endpoint performs upgrade checks.

use lmn_artifacts::progress::NullSink;
use lmn_artifacts::CancelToken;
use lmn_domain::model::{ModelEntry, ModelType, Recipe};
use lmn_domain::{Error, Result};

use crate::state::AppState;

/// Make sure `model` is resident and of the `required` type, loading and
/// downloading on first use. Returns the catalog entry.
pub async fn ensure_loaded(
    state: &AppState,
    model: &str,
    required: ModelType,
) -> Result<ModelEntry> {
    let entry = state.catalog.lookup(model)?;

    if entry.model_type != required {
        return Err(Error::InvalidRequest(format!(
            "{model} is a {} model, this endpoint needs a {required} model",
            entry.model_type
        )));
    }

    if state
        .scheduler
        .get_all_loaded_models()
        .await
        .iter()
        .any(|m| m == model)
    {
        return Ok(entry);
    }

    // First use: fetch artifacts, except for the FLM recipe whose engine
    // pulls its own checkpoints via /pull.
    let entry = if !entry.downloaded && entry.recipe != Recipe::Flm {
        tracing::info!(model, "auto-downloading before first load");
        state
            .artifacts
            .download(&entry, true, &NullSink, &CancelToken::new())
            .await?;
        state.catalog.mark_downloaded(model, true);
        state.catalog.lookup(model)?
    } else {
        entry
    };

    state
        .scheduler
        .load(model, &entry, Default::default(), true)
        .await?;
    Ok(entry)
}
