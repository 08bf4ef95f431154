//! Trace-based inference for probabilistic programs.
//!
//! A model is a Rust function that makes its random choices through a
//! [`TraceContext`]. The engine runs it repeatedly, records every choice in
//! a [`Trace`] and turns the traces into a weighted [`Empirical`] posterior
//! by importance sampling or single-site Metropolis-Hastings.
//!
//! ```rust
//! use probtrace::{
//!     distributions::{Bernoulli, Normal},
//!     FnModel, Inference, ObservedData, PosteriorSettings, TraceContext,
//! };
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let model = FnModel::new("coin", |ctx: &mut TraceContext<'_>| {
//!     let heads = ctx.sample("heads", Bernoulli::new(0.5)?)?.as_f64()?;
//!     ctx.observe("reading", Normal::new(heads, 1.)?)?;
//!     Ok(heads)
//! });
//! let observed = ObservedData::new().with("reading", 0.8);
//! let mut rng = StdRng::seed_from_u64(42);
//! let posterior = Inference::new(model)
//!     .posterior_distribution(PosteriorSettings::default(), &observed, &mut rng)
//!     .unwrap();
//! assert!(posterior.mean().unwrap() > 0.5);
//! ```

pub(crate) mod address;
pub(crate) mod chain;
pub(crate) mod controller;
pub mod distributions;
pub(crate) mod empirical;
pub(crate) mod error;
pub(crate) mod importance;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod proposal;
pub(crate) mod sampler;
pub mod storage;
pub(crate) mod trace;
pub(crate) mod value;

pub use address::{Address, AddressDictionary, AddressIndex, Site};
pub use chain::{log_acceptance_ratio, MhChain, MhStats};
pub use controller::{
    Execution, ExecutionController, InferenceEngine, PriorInflation, TraceContext, TraceGenerator,
    TraceMode,
};
pub use distributions::Distribution;
pub use empirical::Empirical;
pub use error::{PplError, Result};
pub use model::{FnModel, Model};
pub use proposal::{
    MetropolisHastingsProposer, NetworkProposer, PriorProposer, Proposal, ProposalNetwork,
    Proposer, SiteRequest,
};
pub use sampler::{Inference, PosteriorSettings, PriorSettings, Progress, ProgressCallback};
pub use storage::{JsonlConfig, MemoryConfig, OfflineTraces, StorageConfig, TraceRecord, TraceStorage};
pub use trace::{ObservedData, Trace, Variable};
pub use value::Value;
