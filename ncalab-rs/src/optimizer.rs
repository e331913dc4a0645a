//! Optimizer implementations (Adam, AdamW, SGD, RMSprop, Adagrad, Adafactor).
//!
//! Adam and AdamW reuse `candle_nn::AdamW`. The remaining algorithms are
//! implemented here on top of the [`candle_nn::Optimizer`] trait and follow
//! the update rules of their PyTorch counterparts.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var, D};
use candle_nn::{Optimizer, ParamsAdamW, VarMap};

use crate::config::OptimizerMethod;
use crate::error::{NcaError, Result};

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Algorithm to build.
    pub method: OptimizerMethod,
    /// Learning rate
    pub learning_rate: f64,
    /// Beta values for Adam-family optimizers
    pub betas: (f64, f64),
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            method: OptimizerMethod::AdamW,
            learning_rate: OptimizerMethod::AdamW.default_learning_rate(),
            betas: (0.9, 0.99),
        }
    }
}

impl OptimizerConfig {
    /// Build the configured optimizer over every variable of `varmap`.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build(&self, varmap: &VarMap) -> Result<NcaOptimizer> {
        let vars = varmap.all_vars();
        let lr = self.learning_rate;
        let optimizer = match self.method {
            OptimizerMethod::Adam | OptimizerMethod::AdamW => {
                let weight_decay = if self.method == OptimizerMethod::AdamW {
                    0.01
                } else {
                    0.0
                };
                let params = ParamsAdamW {
                    lr,
                    beta1: self.betas.0,
                    beta2: self.betas.1,
                    eps: 1e-8,
                    weight_decay,
                };
                let inner = candle_nn::AdamW::new(vars, params).map_err(|e| {
                    NcaError::Config(format!("failed to create {}: {e}", self.method))
                })?;
                if self.method == OptimizerMethod::Adam {
                    NcaOptimizer::Adam(inner)
                } else {
                    NcaOptimizer::AdamW(inner)
                }
            }
            OptimizerMethod::Sgd => NcaOptimizer::Sgd(Sgd::new(
                vars,
                ParamsSgd {
                    lr,
                    ..ParamsSgd::default()
                },
            )?),
            OptimizerMethod::RmsProp => NcaOptimizer::RmsProp(RmsProp::new(
                vars,
                ParamsRmsProp {
                    lr,
                    ..ParamsRmsProp::default()
                },
            )?),
            OptimizerMethod::Adagrad => NcaOptimizer::Adagrad(Adagrad::new(
                vars,
                ParamsAdagrad {
                    lr,
                    ..ParamsAdagrad::default()
                },
            )?),
            OptimizerMethod::Adafactor => NcaOptimizer::Adafactor(Adafactor::new(
                vars,
                ParamsAdafactor {
                    lr,
                    ..ParamsAdafactor::default()
                },
            )?),
        };
        Ok(optimizer)
    }
}

/// Optimizer selected by [`OptimizerMethod`].
pub enum NcaOptimizer {
    /// Adam (AdamW with zero weight decay).
    Adam(candle_nn::AdamW),
    /// AdamW.
    AdamW(candle_nn::AdamW),
    /// SGD with Nesterov momentum.
    Sgd(Sgd),
    /// RMSprop.
    RmsProp(RmsProp),
    /// Adagrad.
    Adagrad(Adagrad),
    /// Adafactor.
    Adafactor(Adafactor),
}

impl NcaOptimizer {
    /// Apply one update from precomputed gradients.
    ///
    /// # Errors
    ///
    /// Returns an error if any tensor operation fails.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            NcaOptimizer::Adam(o) | NcaOptimizer::AdamW(o) => o.step(grads)?,
            NcaOptimizer::Sgd(o) => o.step(grads)?,
            NcaOptimizer::RmsProp(o) => o.step(grads)?,
            NcaOptimizer::Adagrad(o) => o.step(grads)?,
            NcaOptimizer::Adafactor(o) => o.step(grads)?,
        }
        Ok(())
    }

    /// Get current learning rate.
    pub fn learning_rate(&self) -> f64 {
        match self {
            NcaOptimizer::Adam(o) | NcaOptimizer::AdamW(o) => o.learning_rate(),
            NcaOptimizer::Sgd(o) => o.learning_rate(),
            NcaOptimizer::RmsProp(o) => o.learning_rate(),
            NcaOptimizer::Adagrad(o) => o.learning_rate(),
            NcaOptimizer::Adafactor(o) => o.learning_rate(),
        }
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            NcaOptimizer::Adam(o) | NcaOptimizer::AdamW(o) => o.set_learning_rate(lr),
            NcaOptimizer::Sgd(o) => o.set_learning_rate(lr),
            NcaOptimizer::RmsProp(o) => o.set_learning_rate(lr),
            NcaOptimizer::Adagrad(o) => o.set_learning_rate(lr),
            NcaOptimizer::Adafactor(o) => o.set_learning_rate(lr),
        }
    }

    /// Which algorithm this optimizer runs.
    pub fn method(&self) -> OptimizerMethod {
        match self {
            NcaOptimizer::Adam(_) => OptimizerMethod::Adam,
            NcaOptimizer::AdamW(_) => OptimizerMethod::AdamW,
            NcaOptimizer::Sgd(_) => OptimizerMethod::Sgd,
            NcaOptimizer::RmsProp(_) => OptimizerMethod::RmsProp,
            NcaOptimizer::Adagrad(_) => OptimizerMethod::Adagrad,
            NcaOptimizer::Adafactor(_) => OptimizerMethod::Adafactor,
        }
    }
}

/// Rescale gradients in place so that their global L2 norm is at most
/// `max_norm`. Returns the norm measured before clipping.
///
/// # Errors
///
/// Returns an error if any tensor operation fails.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<f64> {
    let mut total_sq = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total_sq += grad.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let total_norm = total_sq.sqrt();
    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        for var in vars {
            let scaled = match grads.get(var.as_tensor()) {
                Some(grad) => (grad * clip_coef)?,
                None => continue,
            };
            grads.insert(var.as_tensor(), scaled);
        }
    }
    Ok(total_norm)
}

fn float_vars(vars: Vec<Var>) -> Vec<Var> {
    vars.into_iter().filter(|v| v.dtype().is_float()).collect()
}

/// SGD parameters.
#[derive(Debug, Clone, Copy)]
pub struct ParamsSgd {
    /// Learning rate
    pub lr: f64,
    /// Momentum factor
    pub momentum: f64,
    /// Use Nesterov momentum
    pub nesterov: bool,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self {
            lr: 1e-2,
            momentum: 0.9,
            nesterov: true,
        }
    }
}

/// Stochastic gradient descent with (Nesterov) momentum.
pub struct Sgd {
    vars: Vec<(Var, Option<Tensor>)>,
    params: ParamsSgd,
}

impl Optimizer for Sgd {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> candle_core::Result<Self> {
        let vars = float_vars(vars).into_iter().map(|v| (v, None)).collect();
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let ParamsSgd {
            lr,
            momentum,
            nesterov,
        } = self.params;
        for (var, buf) in &mut self.vars {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let direction = if momentum > 0.0 {
                let next = match buf.as_ref() {
                    Some(prev) => ((prev * momentum)? + grad)?,
                    None => grad.clone(),
                };
                let direction = if nesterov {
                    (grad + (&next * momentum)?)?
                } else {
                    next.clone()
                };
                *buf = Some(next);
                direction
            } else {
                grad.clone()
            };
            var.set(&var.as_tensor().sub(&(direction * lr)?)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// RMSprop parameters.
#[derive(Debug, Clone, Copy)]
pub struct ParamsRmsProp {
    /// Learning rate
    pub lr: f64,
    /// Smoothing constant
    pub alpha: f64,
    /// Term added to the denominator
    pub eps: f64,
}

impl Default for ParamsRmsProp {
    fn default() -> Self {
        Self {
            lr: 1e-2,
            alpha: 0.99,
            eps: 1e-8,
        }
    }
}

/// RMSprop.
pub struct RmsProp {
    vars: Vec<(Var, Tensor)>,
    params: ParamsRmsProp,
}

impl Optimizer for RmsProp {
    type Config = ParamsRmsProp;

    fn new(vars: Vec<Var>, params: ParamsRmsProp) -> candle_core::Result<Self> {
        let vars = float_vars(vars)
            .into_iter()
            .map(|v| {
                let square_avg = v.zeros_like()?;
                Ok((v, square_avg))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let ParamsRmsProp { lr, alpha, eps } = self.params;
        for (var, square_avg) in &mut self.vars {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let next = ((&*square_avg * alpha)? + (grad.sqr()? * (1.0 - alpha))?)?;
            let denom = (next.sqrt()? + eps)?;
            let update = (grad.div(&denom)? * lr)?;
            var.set(&var.as_tensor().sub(&update)?)?;
            *square_avg = next;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// Adagrad parameters.
#[derive(Debug, Clone, Copy)]
pub struct ParamsAdagrad {
    /// Learning rate
    pub lr: f64,
    /// Term added to the denominator
    pub eps: f64,
}

impl Default for ParamsAdagrad {
    fn default() -> Self {
        Self { lr: 1e-2, eps: 1e-10 }
    }
}

/// Adagrad.
pub struct Adagrad {
    vars: Vec<(Var, Tensor)>,
    params: ParamsAdagrad,
}

impl Optimizer for Adagrad {
    type Config = ParamsAdagrad;

    fn new(vars: Vec<Var>, params: ParamsAdagrad) -> candle_core::Result<Self> {
        let vars = float_vars(vars)
            .into_iter()
            .map(|v| {
                let sum = v.zeros_like()?;
                Ok((v, sum))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let ParamsAdagrad { lr, eps } = self.params;
        for (var, sum) in &mut self.vars {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let next = (&*sum + grad.sqr()?)?;
            let denom = (next.sqrt()? + eps)?;
            let update = (grad.div(&denom)? * lr)?;
            var.set(&var.as_tensor().sub(&update)?)?;
            *sum = next;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// Adafactor parameters.
#[derive(Debug, Clone, Copy)]
pub struct ParamsAdafactor {
    /// Learning rate (upper bound of the relative step size)
    pub lr: f64,
    /// Decay exponent of the second-moment averaging rate
    pub beta2_decay: f64,
    /// Floor of the squared-gradient estimate
    pub eps1: f64,
    /// Floor of the parameter scale
    pub eps2: f64,
    /// Update clipping threshold
    pub d: f64,
}

impl Default for ParamsAdafactor {
    fn default() -> Self {
        Self {
            lr: 1e-2,
            beta2_decay: -0.8,
            eps1: f64::from(f32::EPSILON),
            eps2: 1e-3,
            d: 1.0,
        }
    }
}

enum SecondMoment {
    Factored { row: Tensor, col: Tensor },
    Full(Tensor),
}

/// Adafactor with factored second moments for parameters of rank >= 2.
pub struct Adafactor {
    vars: Vec<(Var, SecondMoment)>,
    params: ParamsAdafactor,
    step_t: usize,
}

impl Optimizer for Adafactor {
    type Config = ParamsAdafactor;

    fn new(vars: Vec<Var>, params: ParamsAdafactor) -> candle_core::Result<Self> {
        let vars = float_vars(vars)
            .into_iter()
            .map(|v| {
                let moment = if v.rank() >= 2 {
                    let zeros = v.zeros_like()?;
                    SecondMoment::Factored {
                        row: zeros.mean_keepdim(D::Minus1)?,
                        col: zeros.mean_keepdim(D::Minus2)?,
                    }
                } else {
                    SecondMoment::Full(v.zeros_like()?)
                };
                Ok((v, moment))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            params,
            step_t: 0,
        })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step_t += 1;
        let p = self.params;
        let t = self.step_t as f64;
        let beta = t.powf(p.beta2_decay);
        let rho = p.lr.min(1.0 / t.sqrt());
        for (var, moment) in &mut self.vars {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let param = var.as_tensor();
            let param_rms = rms(param)?;
            let alpha = p.eps2.max(param_rms) * rho;

            let grad_sq = grad.sqr()?;
            let var_estimate = match moment {
                SecondMoment::Factored { row, col } => {
                    let next_row = ((&*row * (1.0 - beta))? + (grad_sq.mean_keepdim(D::Minus1)? * beta)?)?;
                    let next_col = ((&*col * (1.0 - beta))? + (grad_sq.mean_keepdim(D::Minus2)? * beta)?)?;
                    let row_mean = next_row.mean_keepdim(D::Minus2)?.maximum(p.eps1)?;
                    let estimate = next_row.broadcast_mul(&next_col)?.broadcast_div(&row_mean)?;
                    *row = next_row;
                    *col = next_col;
                    estimate
                }
                SecondMoment::Full(v) => {
                    let next = ((&*v * (1.0 - beta))? + (&grad_sq * beta)?)?;
                    *v = next.clone();
                    next
                }
            };
            let update = var_estimate
                .maximum(p.eps1 * p.eps1)?
                .sqrt()?
                .recip()?
                .mul(grad)?;
            let denom = (rms(&update)? / p.d).max(1.0);
            var.set(&param.sub(&(update * (alpha / denom))?)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

fn rms(t: &Tensor) -> candle_core::Result<f64> {
    let n = t.elem_count().max(1) as f64;
    let sum_sq = t.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
    Ok((sum_sq / n).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// Minimize ||w - 3||^2 starting from zero; returns the final loss.
    fn run_quadratic(method: OptimizerMethod, lr: f64, steps: usize) -> f32 {
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let w = vb
            .get_with_hints((2, 3), "w", candle_nn::Init::Const(0.0))
            .unwrap();
        let config = OptimizerConfig {
            method,
            learning_rate: lr,
            ..Default::default()
        };
        let mut optimizer = config.build(&varmap).unwrap();
        let loss_of = |w: &Tensor| (w - 3.0).unwrap().sqr().unwrap().mean_all().unwrap();
        for _ in 0..steps {
            let grads = loss_of(&w).backward().unwrap();
            optimizer.step(&grads).unwrap();
        }
        loss_of(&w).to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_every_method_reduces_quadratic() {
        for method in OptimizerMethod::ALL {
            let final_loss = run_quadratic(method, 0.05, 50);
            assert!(final_loss < 9.0, "{method} did not decrease: {final_loss}");
        }
    }

    #[test]
    fn test_sgd_converges() {
        let final_loss = run_quadratic(OptimizerMethod::Sgd, 0.1, 100);
        assert!(final_loss < 1e-3, "loss {final_loss}");
    }

    #[test]
    fn test_build_reports_method_and_lr() {
        let varmap = VarMap::new();
        let config = OptimizerConfig {
            method: OptimizerMethod::Adagrad,
            learning_rate: 0.02,
            ..Default::default()
        };
        let mut optimizer = config.build(&varmap).unwrap();
        assert_eq!(optimizer.method(), OptimizerMethod::Adagrad);
        assert_eq!(optimizer.learning_rate(), 0.02);
        optimizer.set_learning_rate(0.01);
        assert_eq!(optimizer.learning_rate(), 0.01);
    }

    #[test]
    fn test_clip_grad_norm_bounds_norm() {
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let w = vb
            .get_with_hints(4, "w", candle_nn::Init::Const(10.0))
            .unwrap();
        let mut grads = w.sqr().unwrap().sum_all().unwrap().backward().unwrap();
        let vars = varmap.all_vars();
        let before = clip_grad_norm(&vars, &mut grads, 1.0).unwrap();
        assert!((before - 40.0).abs() < 1e-3);

        let after = clip_grad_norm(&vars, &mut grads, 1.0).unwrap();
        assert!(after <= 1.0 + 1e-4, "norm after clipping: {after}");
    }
}
