use crate::{PassConfig, Transform};
use murk_analysis::{collect_metrics, compare, Metrics};
use murk_core::cfg_ir::ControlFlow;
use murk_core::Chunk;
use murk_utils::errors::TransformError;
use rand::rngs::StdRng;
use tracing::info;

/// Trait for running a sequence of whole-chunk transforms on one chunk.
pub trait Pass {
    /// Runs `passes` in order and returns the names of the ones whose result was kept.
    fn run(
        &self,
        chunk: &mut Chunk,
        passes: &[Box<dyn Transform>],
        cfg: &PassConfig,
        rng: &mut StdRng,
    ) -> Result<Vec<&'static str>, TransformError>;
}

/// Default implementation of the Pass trait.
///
/// Each transform runs on a snapshot; the snapshot replaces the chunk when the potency delta
/// clears the threshold or the config is aggressive.
pub struct DefaultPass;

fn measure(chunk: &mut Chunk) -> Result<Metrics, TransformError> {
    let flow = ControlFlow::build(chunk)?;
    Ok(collect_metrics(&flow)?)
}

impl Pass for DefaultPass {
    fn run(
        &self,
        chunk: &mut Chunk,
        passes: &[Box<dyn Transform>],
        cfg: &PassConfig,
        rng: &mut StdRng,
    ) -> Result<Vec<&'static str>, TransformError> {
        let mut applied = Vec::new();
        if chunk.is_empty() {
            return Ok(applied);
        }

        for pass in passes {
            let before = measure(chunk)?;
            let mut snapshot = chunk.clone();

            let mutated = pass.apply(&mut snapshot, rng)?;
            if !mutated {
                continue;
            }

            let after = measure(&mut snapshot)?;
            let delta = compare(&before, &after);

            let keep = delta >= cfg.accept_threshold || cfg.aggressive;
            info!(
                "{:>14} Δ{:+.2} {}",
                pass.name(),
                delta,
                if keep { "✓" } else { "×" }
            );

            if keep {
                *chunk = snapshot;
                applied.push(pass.name());
            }
        }
        Ok(applied)
    }
}

/// Convenience function to run the default pass.
pub fn run(
    chunk: &mut Chunk,
    passes: &[Box<dyn Transform>],
    cfg: &PassConfig,
    rng: &mut StdRng,
) -> Result<Vec<&'static str>, TransformError> {
    DefaultPass.run(chunk, passes, cfg, rng)
}
