//! Parameter initialization applied once over a freshly allocated module.
//!
//! Layers allocate their parameters with fixed placeholders (zero weights,
//! unit normalization scales). An [`InitPolicy`] then visits every float
//! parameter exactly once before the module is handed out.

use burn::{
    module::{Module, ModuleMapper, Param},
    nn::Initializer,
    prelude::*,
};

use crate::error::VitError;

/// Rewrites one parameter tensor. Must return a tensor of the same shape.
pub trait InitPolicy<B: Backend> {
    fn init<const D: usize>(&mut self, tensor: Tensor<B, D>) -> Tensor<B, D>;
}

/// Draws every weight-like parameter (rank >= 2: linear weights, class
/// token, positional table) from a burn [`Initializer`]. Rank-1 parameters
/// keep their placeholders, so biases stay zero and normalization layers
/// start as the identity.
#[derive(Debug, Clone)]
pub struct InitializerPolicy {
    initializer: Initializer,
}

impl InitializerPolicy {
    pub fn new(initializer: Initializer) -> Self {
        Self { initializer }
    }
}

impl<B: Backend> InitPolicy<B> for InitializerPolicy {
    fn init<const D: usize>(&mut self, tensor: Tensor<B, D>) -> Tensor<B, D> {
        if D < 2 {
            return tensor;
        }

        let dims = tensor.dims();
        let rank = dims.len();
        let device = tensor.device();
        let param: Param<Tensor<B, D>> = self.initializer.init_with(
            dims,
            Some(dims[rank - 2]),
            Some(dims[rank - 1]),
            &device,
        );

        param.val()
    }
}

struct PolicyMapper<'a, P> {
    policy: &'a mut P,
    visited: usize,
    reshaped: Option<(Vec<usize>, Vec<usize>)>,
}

impl<B: Backend, P: InitPolicy<B>> ModuleMapper<B> for PolicyMapper<'_, P> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        self.visited += 1;
        let policy = &mut *self.policy;
        let reshaped = &mut self.reshaped;

        param.map(|tensor| {
            let dims = tensor.dims();
            let require_grad = tensor.is_require_grad();
            let updated = policy.init(tensor.clone().detach());

            if updated.dims() != dims {
                // keep the placeholder; `apply` reports the first offender
                reshaped.get_or_insert((dims.to_vec(), updated.dims().to_vec()));
                return tensor;
            }

            updated.set_require_grad(require_grad)
        })
    }
}

/// Runs `policy` over every float parameter of `module`, returning the
/// rewritten module and the number of parameters visited.
///
/// Fails with [`VitError::InvalidConfig`] if the policy changes any
/// parameter's shape.
pub fn apply<B, M, P>(module: M, policy: &mut P) -> crate::Result<(M, usize)>
where
    B: Backend,
    M: Module<B>,
    P: InitPolicy<B>,
{
    let mut mapper = PolicyMapper {
        policy,
        visited: 0,
        reshaped: None,
    };
    let module = module.map(&mut mapper);

    if let Some((expected, actual)) = mapper.reshaped {
        tracing::warn!(?expected, ?actual, "initialization policy changed a parameter shape");
        return Err(VitError::InvalidConfig(format!(
            "initialization policy changed parameter shape {expected:?} to {actual:?}"
        )));
    }

    tracing::trace!(parameters = mapper.visited, "applied initialization policy");
    Ok((module, mapper.visited))
}
