use anyhow::Result;
use rand::Rng;

use crate::{
    controller::{ExecutionController, TraceMode},
    empirical::Empirical,
    model::Model,
    sampler::Reporter,
    trace::Trace,
};

/// Generate `num_traces` independent traces and weight them.
///
/// In prior mode every trace gets weight one, otherwise its log importance
/// weight. `map` turns each trace into the stored value. The returned
/// collection is finalized.
pub(crate) fn run_importance<M, R, U>(
    controller: &ExecutionController<'_, M>,
    num_traces: u64,
    mut map: impl FnMut(&Trace<M::Output>) -> U,
    reporter: &mut Reporter<'_>,
    rng: &mut R,
) -> Result<Empirical<U>>
where
    M: Model,
    R: Rng + ?Sized,
{
    controller.check()?;
    let mut posterior = Empirical::new();
    for (done, trace) in (1..=num_traces).zip(controller.traces(&mut *rng)) {
        let trace = trace?;
        let log_weight = match controller.trace_mode() {
            TraceMode::Prior => 0.,
            TraceMode::Posterior => trace.log_importance_weight(),
        };
        posterior.add_log_weighted(map(&trace), log_weight)?;
        reporter.report(done, None);
    }
    posterior.finalize();
    Ok(posterior)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        controller::{InferenceEngine, TraceContext},
        distributions::{Bernoulli, Distribution, Normal},
        error::PplError,
        model::FnModel,
        trace::ObservedData,
    };
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn coin() -> FnModel<impl Fn(&mut TraceContext<'_>) -> Result<f64> + Send + Sync, f64> {
        FnModel::new("coin", |ctx: &mut TraceContext<'_>| {
            let z = ctx.sample("z", Bernoulli::new(0.5)?)?.as_f64()?;
            ctx.observe("y", Normal::new(z, 1.)?)?;
            Ok(z)
        })
    }

    #[test]
    fn prior_weights_are_equal() -> Result<()> {
        let model = coin();
        let controller = ExecutionController::new(&model);
        let mut rng = StdRng::seed_from_u64(0);
        for n in [1, 7, 100] {
            let posterior = run_importance(
                &controller,
                n,
                |t| *t.result(),
                &mut Reporter::silent(),
                &mut rng,
            )?;
            assert_eq!(posterior.len() as u64, n);
            assert_abs_diff_eq!(posterior.effective_sample_size()?, n as f64, epsilon = 1e-9);
            let total: f64 = posterior.weights()?.iter().sum();
            assert_abs_diff_eq!(total, 1., epsilon = 1e-12);
        }
        Ok(())
    }

    #[test]
    fn posterior_weights_follow_likelihood() -> Result<()> {
        let model = coin();
        let observed = ObservedData::new().with("y", 2.);
        let controller = ExecutionController::new(&model)
            .mode(TraceMode::Posterior)
            .observed(&observed);
        let mut rng = StdRng::seed_from_u64(1);
        let posterior = run_importance(
            &controller,
            50,
            |t| *t.result(),
            &mut Reporter::silent(),
            &mut rng,
        )?;
        for (i, (&z, _)) in posterior.iter().enumerate() {
            let expected = Normal::new(z, 1.)?.log_prob(&2f64.into());
            assert_abs_diff_eq!(posterior.log_weights()[i], expected, epsilon = 1e-12);
        }
        assert!(posterior.effective_sample_size()? < 50.);
        Ok(())
    }

    #[test]
    fn model_errors_abort_the_run() {
        let model = FnModel::new("failing", |ctx: &mut TraceContext<'_>| {
            let x = ctx.sample("x", Normal::new(0., 1.)?)?.as_f64()?;
            if x > 1. {
                anyhow::bail!("value too large");
            }
            Ok(x)
        });
        let controller = ExecutionController::new(&model);
        let mut rng = StdRng::seed_from_u64(2);
        let err = run_importance(
            &controller,
            1000,
            |t| *t.result(),
            &mut Reporter::silent(),
            &mut rng,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "value too large");
    }

    #[test]
    fn missing_network_fails_before_running() {
        let model = coin();
        let controller = ExecutionController::new(&model)
            .mode(TraceMode::Posterior)
            .engine(InferenceEngine::ImportanceSamplingWithNetwork);
        let mut rng = StdRng::seed_from_u64(3);
        let err = run_importance(
            &controller,
            10,
            |t| *t.result(),
            &mut Reporter::silent(),
            &mut rng,
        )
        .unwrap_err();
        assert_eq!(
            err.downcast_ref::<PplError>(),
            Some(&PplError::MissingInferenceNetwork)
        );
    }
}
