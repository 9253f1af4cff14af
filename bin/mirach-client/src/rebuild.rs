//! State rebuild: replay the whole block log through the authoritative
//! execution path.

use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::*;

use mirach_blocklog::BlockLog;
use mirach_consensus_logic::Chain;
use mirach_state::collections::ACCOUNTS;

use crate::args::RebuildOptions;

/// Blocks replayed between flushes.
const FLUSH_EVERY: i64 = 1_000;

/// Replays `blocks.log` from genesis into a freshly wiped state store.
/// The chain must be constructed over the same cache; its backend is not
/// touched (the log is the source here).
pub async fn rebuild_from_log(
    chain: &Arc<Chain>,
    log: &mut BlockLog,
    opts: &RebuildOptions,
) -> anyhow::Result<()> {
    let height = log.height();
    if height < 0 {
        bail!("cannot rebuild: block log is empty");
    }
    info!(%height, no_verify = %opts.no_verify, no_validate = %opts.no_validate, "rebuilding state from block log");

    let cache = chain.cache().clone();
    // No shadow copies while replaying; nothing rolls back here.
    cache.set_shadowing(false);

    let mut n: i64 = 0;
    while n <= height {
        let end = (n + FLUSH_EVERY - 1).min(height);
        let blocks = log.read_range(n, end).context("reading block range")?;

        for b in &blocks {
            if !opts.no_verify {
                if !b.verify_hash() {
                    bail!("block {} fails hash verification", b.id);
                }
                if b.id > 0 {
                    let witness = cache
                        .find_one(ACCOUNTS, &b.witness)
                        .await?
                        .and_then(|doc| {
                            doc.get("witness_pub")
                                .and_then(|v| v.as_str().map(str::to_owned))
                        });
                    match witness {
                        Some(pub_b58) => b
                            .verify_signature(&pub_b58)
                            .map_err(|_| anyhow::anyhow!("block {} bad signature", b.id))?,
                        None => warn!(id = %b.id, witness = %b.witness, "no witness key on record, skipping signature check"),
                    }
                }
            }

            if !opts.no_validate && b.id > 0 {
                let (_, distributed) = chain
                    .execute_block_transactions(b, false)
                    .await
                    .with_context(|| format!("replaying block {}", b.id))?;
                if distributed != b.dist {
                    bail!("block {} dist mismatch on replay", b.id);
                }
            }

            cache.set_head_block(b.id);
        }

        cache.write_to_disk().await?;
        debug!(through = %end, "rebuild flushed");
        n = end + 1;
    }

    cache.set_shadowing(true);
    info!(%height, "rebuild complete");
    Ok(())
}
