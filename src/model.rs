//! Core abstraction for probabilistic programs.
//!
//! Provides the `Model` trait. A model is an ordinary Rust function that
//! makes its random choices through a [`TraceContext`], which lets the
//! inference engines record, replay and condition those choices.

use std::marker::PhantomData;

use anyhow::Result;

use crate::controller::TraceContext;

/// A probabilistic program.
///
/// The trait is thread-safe so that several chains can execute the same
/// model in parallel. Every execution gets its own context, so `forward`
/// should keep no state between calls.
pub trait Model: Send + Sync {
    /// The value the program returns.
    type Output: Clone + Send + 'static;

    fn name(&self) -> &str {
        "Unnamed model"
    }

    /// Run the program once, making every random choice through `ctx`.
    fn forward(&self, ctx: &mut TraceContext<'_>) -> Result<Self::Output>;
}

/// A [`Model`] defined by a closure.
pub struct FnModel<F, T> {
    name: String,
    forward: F,
    _output: PhantomData<fn() -> T>,
}

impl<F, T> FnModel<F, T>
where
    F: Fn(&mut TraceContext<'_>) -> Result<T> + Send + Sync,
    T: Clone + Send + 'static,
{
    pub fn new(name: impl Into<String>, forward: F) -> Self {
        FnModel {
            name: name.into(),
            forward,
            _output: PhantomData,
        }
    }
}

impl<F, T> Model for FnModel<F, T>
where
    F: Fn(&mut TraceContext<'_>) -> Result<T> + Send + Sync,
    T: Clone + Send + 'static,
{
    type Output = T;

    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, ctx: &mut TraceContext<'_>) -> Result<T> {
        (self.forward)(ctx)
    }
}

impl<M: Model + ?Sized> Model for &M {
    type Output = M::Output;

    fn name(&self) -> &str {
        (**self).name()
    }

    fn forward(&self, ctx: &mut TraceContext<'_>) -> Result<Self::Output> {
        (**self).forward(ctx)
    }
}
