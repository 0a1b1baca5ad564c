//! The cascade engine.
//!
//! When products are stripped or removed, derived products may have to
//! follow, according to their product type's cascade rule. The engine runs
//! a bounded fixed-point iteration: each cycle visits every product type
//! with a rule, strips or removes the newly orphaned products, and a
//! product acted upon is itself a potential trigger for the next cycle.
//! The grace period reprieves freshly orphaned products so a late
//! ingestion can still relink them.

use crate::archive::Archive;
use crate::plugin::CascadeRule;
use muninn_core::Result;
use tracing::{debug, instrument, warn};

/// Drive strip/remove propagation to a fixed point.
///
/// The first fatal error is surfaced, but the remaining candidates of the
/// running cycle are still attempted so one broken product does not block
/// unrelated branches.
#[instrument(skip(archive))]
pub(crate) async fn establish_invariants(archive: &Archive) -> Result<()> {
    let mut first_error: Option<muninn_core::Error> = None;
    let mut cycle = 0;
    let mut repeat = true;

    while repeat && cycle < archive.max_cascade_cycles() {
        repeat = false;
        cycle += 1;

        for plugin in archive.registry().product_type_plugins() {
            let rule = plugin.cascade_rule();
            if rule == CascadeRule::Ignore {
                continue;
            }
            let product_type = plugin.product_type();

            // products whose sources were removed
            let strip = matches!(rule, CascadeRule::CascadePurgeAsStrip | CascadeRule::Strip);
            let orphans = archive
                .database()
                .find_products_without_source(
                    product_type,
                    archive.cascade_grace_period(),
                    strip,
                )
                .await?;
            if !orphans.is_empty() {
                debug!(product_type, cycle, count = orphans.len(), "cascading removed sources");
                repeat = true;
            }
            for product in &orphans {
                let outcome = if strip {
                    archive.strip_product(product).await
                } else {
                    archive.purge_product(product).await
                };
                if let Err(error) = outcome {
                    warn!(%error, "cascade action failed; continuing with remaining products");
                    first_error.get_or_insert(error);
                }
            }

            // the *_PURGE rules only react to removed sources
            if matches!(
                rule,
                CascadeRule::CascadePurgeAsStrip | CascadeRule::CascadePurge
            ) {
                continue;
            }

            // products whose sources all lost their bytes
            let unavailable = archive
                .database()
                .find_products_without_available_source(
                    product_type,
                    archive.cascade_grace_period(),
                )
                .await?;
            if !unavailable.is_empty() {
                debug!(product_type, cycle, count = unavailable.len(), "cascading stripped sources");
                repeat = true;
            }
            for product in &unavailable {
                let outcome = if matches!(rule, CascadeRule::Strip | CascadeRule::Cascade) {
                    archive.strip_product(product).await
                } else {
                    archive.purge_product(product).await
                };
                if let Err(error) = outcome {
                    warn!(%error, "cascade action failed; continuing with remaining products");
                    first_error.get_or_insert(error);
                }
            }
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
